//! Record store: the only shared mutable resource of the protocol
//!
//! Documents carry a version number; every read-modify-write goes through a
//! conditional update that fails with [`StoreError::VersionConflict`] when
//! another writer got there first. [`with_retry`] turns that into a bounded
//! retry loop.

mod file;
mod memory;
mod retry;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use retry::{with_retry, RetryPolicy};

use crate::attendance::{AttendanceRecord, Session};
use crate::fraud::FraudReport;

/// A document together with the version it was read at
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Outcome of a first-write-wins insert
#[derive(Debug, Clone)]
pub struct Inserted<T> {
    pub stored: Versioned<T>,
    /// False when an existing document was returned instead
    pub created: bool,
}

/// Errors crossing the storage boundary. Closed so callers can match on
/// them instead of inspecting messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store timed out: {0}")]
    Timeout(String),

    #[error("version conflict on {key}: expected v{expected}, found v{found}")]
    VersionConflict { key: String, expected: u64, found: u64 },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The owning session ended before the write landed
    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("store error: {0}")]
    Unknown(String),
}

impl StoreError {
    /// Unavailability, timeouts and unexplained failures
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::Timeout(_)
                | StoreError::Corrupt(_)
                | StoreError::Unknown(_)
        )
    }
}

/// Document store for sessions, attendance records and fraud reports
pub trait RecordStore: Send + Sync {
    /// Health probe used by the replay daemon
    fn ping(&self) -> Result<(), StoreError>;

    fn get_session(&self, session_id: &str) -> Result<Option<Versioned<Session>>, StoreError>;

    /// Insert an active session, atomically rejecting it with
    /// `AlreadyExists` if its class already has an active one
    fn create_session(&self, session: Session) -> Result<Versioned<Session>, StoreError>;

    /// Conditional replace; returns the new version
    fn update_session(&self, session: Session, expected_version: u64) -> Result<u64, StoreError>;

    fn active_session_for_class(&self, class_id: &str) -> Result<Option<Session>, StoreError>;

    fn sessions_for_class(&self, class_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Every session still accepting check-ins, across all classes
    fn active_sessions(&self) -> Result<Vec<Session>, StoreError>;

    fn get_record(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<Versioned<AttendanceRecord>>, StoreError>;

    /// First-write-wins insert keyed by (session, student)
    fn insert_record(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError>;

    /// Like `insert_record`, but fails with `SessionClosed` unless the
    /// owning session is active. The status is checked under the same write
    /// as the insert, so a concurrent end cannot slip in between.
    fn insert_record_while_active(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError>;

    /// Conditional replace keyed by (session, student); returns the new version
    fn update_record(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError>;

    /// Like `update_record`, but fails with `SessionClosed` once the owning
    /// session has ended
    fn update_record_while_active(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError>;

    /// All-or-nothing conditional replace of several records
    fn update_records(&self, updates: Vec<(AttendanceRecord, u64)>) -> Result<(), StoreError>;

    fn records_for_session(&self, session_id: &str) -> Result<Vec<Versioned<AttendanceRecord>>, StoreError>;

    fn records_for_student(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, StoreError>;

    fn append_fraud_report(&self, report: FraudReport) -> Result<(), StoreError>;

    fn fraud_reports(&self, class_id: &str) -> Result<Vec<FraudReport>, StoreError>;
}
