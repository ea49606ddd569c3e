//! Attendance data model
//!
//! Sessions, per-student attendance records with their peer edges, and the
//! pure trust-scoring function that classifies each record.

mod record;
mod scoring;
mod session;

pub use record::{
    AttendanceRecord, BiometricResult, EdgeInsert, OverrideDecision, PeerVerification,
    TeacherOverride,
};
pub use scoring::{score, score_with, ScoringPolicy, TrustScore};
pub use session::{Session, SessionStatus};
