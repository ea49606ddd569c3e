//! Fraud pattern detection over a class's ended sessions

mod detector;
mod report;

pub use detector::{detect, FraudPolicy, SessionGraph};
pub use report::{FraudReport, PatternKind, Severity, SuspiciousPattern};
