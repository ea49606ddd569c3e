//! Service error taxonomy
//!
//! Every failure of a core operation falls into exactly one [`ErrorClass`].
//! Only `Infrastructure` failures may be absorbed by the offline fallback;
//! everything else reaches the caller.

use crate::storage::StoreError;
use crate::token::TokenError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad or missing input, rejected before any state change
    Validation,
    /// Bad signature, expired token, self-scan, wrong token type
    Protocol,
    /// Not found, already exists, permission denied
    Conflict,
    /// Write conflicts that outlasted the retry budget
    Concurrency,
    /// Store or network unreachable
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttendanceError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("invalid token: {0}")]
    InvalidToken(TokenError),

    #[error("token expired")]
    TokenExpired,

    #[error("a student cannot verify themselves")]
    SelfScanRejected,

    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is not active")]
    SessionNotActive(String),

    #[error("class {class_id} already has active session {session_id}")]
    AlreadyActive { class_id: String, session_id: String },

    #[error("{student_id} has not checked in to session {session_id}")]
    NotCheckedIn { session_id: String, student_id: String },

    #[error("{scanner_id} and {peer_id} already verified each other")]
    AlreadyVerified { scanner_id: String, peer_id: String },

    #[error("{0} is not permitted to perform this action")]
    PermissionDenied(String),

    #[error("gave up after {attempts} conflicting write attempts on {key}")]
    ConcurrencyExhausted { key: String, attempts: u32 },

    #[error("biometric service failed: {0}")]
    BiometricUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TokenError> for AttendanceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired { .. } => AttendanceError::TokenExpired,
            other => AttendanceError::InvalidToken(other),
        }
    }
}

impl AttendanceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttendanceError::Validation { .. } => ErrorClass::Validation,
            AttendanceError::InvalidToken(_)
            | AttendanceError::TokenExpired
            | AttendanceError::SelfScanRejected
            | AttendanceError::RateLimited(_) => ErrorClass::Protocol,
            AttendanceError::SessionNotFound(_)
            | AttendanceError::SessionNotActive(_)
            | AttendanceError::AlreadyActive { .. }
            | AttendanceError::NotCheckedIn { .. }
            | AttendanceError::AlreadyVerified { .. }
            | AttendanceError::PermissionDenied(_) => ErrorClass::Conflict,
            AttendanceError::ConcurrencyExhausted { .. } => ErrorClass::Concurrency,
            AttendanceError::BiometricUnavailable(_) => ErrorClass::Infrastructure,
            AttendanceError::Store(err) => match err {
                StoreError::VersionConflict { .. } => ErrorClass::Concurrency,
                StoreError::AlreadyExists(_) | StoreError::NotFound(_) | StoreError::SessionClosed(_) => {
                    ErrorClass::Conflict
                }
                _ => ErrorClass::Infrastructure,
            },
        }
    }

    /// Eligible for the degraded local path / offline queue
    pub fn is_infrastructure(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// Map a store-level `SessionClosed` onto the protocol error callers expect
    pub(crate) fn closed_as_not_active(self) -> Self {
        match self {
            AttendanceError::Store(StoreError::SessionClosed(id)) => AttendanceError::SessionNotActive(id),
            other => other,
        }
    }

    pub(crate) fn is_write_conflict(&self) -> bool {
        matches!(self, AttendanceError::Store(StoreError::VersionConflict { .. }))
    }

    pub(crate) fn required(field: &'static str, value: &str) -> Result<(), AttendanceError> {
        if value.trim().is_empty() {
            return Err(AttendanceError::Validation {
                field,
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(AttendanceError::from(TokenError::SignatureMismatch).class(), ErrorClass::Protocol);
        assert_eq!(
            AttendanceError::from(TokenError::Expired { age_ms: 61_000, ttl_ms: 60_000 }),
            AttendanceError::TokenExpired
        );
        assert_eq!(AttendanceError::SelfScanRejected.class(), ErrorClass::Protocol);
        assert_eq!(AttendanceError::PermissionDenied("x".into()).class(), ErrorClass::Conflict);
        assert!(AttendanceError::Store(StoreError::Timeout("t".into())).is_infrastructure());
        assert!(!AttendanceError::TokenExpired.is_infrastructure());
        assert_eq!(
            AttendanceError::Store(StoreError::VersionConflict { key: "k".into(), expected: 1, found: 2 }).class(),
            ErrorClass::Concurrency
        );
        let closed = AttendanceError::Store(StoreError::SessionClosed("s1".into()));
        assert_eq!(closed.class(), ErrorClass::Conflict);
        assert_eq!(closed.closed_as_not_active(), AttendanceError::SessionNotActive("s1".into()));
    }

    #[test]
    fn test_required() {
        assert!(AttendanceError::required("student_id", "s1").is_ok());
        assert!(matches!(
            AttendanceError::required("student_id", "  "),
            Err(AttendanceError::Validation { field: "student_id", .. })
        ));
    }
}
