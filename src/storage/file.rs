//! JSON file-backed record store
//!
//! Persistent store with JSON serialization: every successful write
//! rewrites the whole document set. Open → work → the file is always current.
//!
//! Single process only. The file is read once at open and there is no
//! cross-process lock, so two processes sharing one file overwrite each
//! other's writes. Within a process, writes are serialized and a write
//! whose save fails is rolled back in memory too.

use super::memory::{MemoryStore, StoreState};
use super::{Inserted, RecordStore, StoreError, Versioned};
use crate::attendance::{AttendanceRecord, Session};
use crate::fraud::FraudReport;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open an existing store file, or start empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
            let state: StoreState = serde_json::from_str(&data)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
            info!(
                "Loaded store {}: {} sessions, {} records",
                path.display(),
                state.sessions.len(),
                state.records.len()
            );
            state
        } else {
            StoreState::default()
        };
        Ok(Self {
            inner: MemoryStore::from_state(state),
            path,
            io_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Unknown(format!("serialize store: {}", e)))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.path.display(), e)))
    }

    /// Apply a write to the in-memory state and persist it. If the file
    /// cannot be written the in-memory state is restored, so readers never
    /// see a change the caller was told failed.
    fn write_through<T>(&self, op: impl FnOnce(&MemoryStore) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        let before = self.inner.snapshot()?;
        let value = op(&self.inner)?;
        let after = self.inner.snapshot()?;
        if let Err(e) = self.save(&after) {
            warn!("Rolling back store write: {}", e);
            self.inner.restore(before);
            return Err(e);
        }
        Ok(value)
    }
}

impl RecordStore for JsonFileStore {
    fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping()
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Versioned<Session>>, StoreError> {
        self.inner.get_session(session_id)
    }

    fn create_session(&self, session: Session) -> Result<Versioned<Session>, StoreError> {
        self.write_through(|inner| inner.create_session(session))
    }

    fn update_session(&self, session: Session, expected_version: u64) -> Result<u64, StoreError> {
        self.write_through(|inner| inner.update_session(session, expected_version))
    }

    fn active_session_for_class(&self, class_id: &str) -> Result<Option<Session>, StoreError> {
        self.inner.active_session_for_class(class_id)
    }

    fn sessions_for_class(&self, class_id: &str) -> Result<Vec<Session>, StoreError> {
        self.inner.sessions_for_class(class_id)
    }

    fn active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.inner.active_sessions()
    }

    fn get_record(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<Versioned<AttendanceRecord>>, StoreError> {
        self.inner.get_record(session_id, student_id)
    }

    fn insert_record(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError> {
        self.write_through(|inner| inner.insert_record(record))
    }

    fn insert_record_while_active(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError> {
        self.write_through(|inner| inner.insert_record_while_active(record))
    }

    fn update_record(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError> {
        self.write_through(|inner| inner.update_record(record, expected_version))
    }

    fn update_record_while_active(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError> {
        self.write_through(|inner| inner.update_record_while_active(record, expected_version))
    }

    fn update_records(&self, updates: Vec<(AttendanceRecord, u64)>) -> Result<(), StoreError> {
        self.write_through(|inner| inner.update_records(updates))
    }

    fn records_for_session(&self, session_id: &str) -> Result<Vec<Versioned<AttendanceRecord>>, StoreError> {
        self.inner.records_for_session(session_id)
    }

    fn records_for_student(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.inner.records_for_student(student_id)
    }

    fn append_fraud_report(&self, report: FraudReport) -> Result<(), StoreError> {
        self.write_through(|inner| inner.append_fraud_report(report))
    }

    fn fraud_reports(&self, class_id: &str) -> Result<Vec<FraudReport>, StoreError> {
        self.inner.fraud_reports(class_id)
    }
}
