//! Rollcall: peer-verified attendance
//!
//! A session authority issues short-lived signed tokens, students
//! cross-verify each other, and the resulting peer graph is reduced into a
//! trust classification that a teacher can override. An offline queue keeps
//! clients working through store outages.

pub mod attendance;
pub mod clock;
pub mod config;
pub mod error;
pub mod fraud;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod token;

pub use attendance::{AttendanceRecord, Session, TrustScore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProtocolConfig;
pub use error::{AttendanceError, ErrorClass};
pub use fraud::FraudReport;
pub use resilience::{Delivery, OfflineQueue, ReplayDaemon, ResilientClient};
pub use service::AttendanceService;
pub use storage::{JsonFileStore, MemoryStore, RecordStore};
pub use token::{Token, TokenCodec, TokenKind};
