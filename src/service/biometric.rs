//! Boundary to the external face matcher

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiometricMatch {
    pub matched: bool,
    /// 0.0 ..= 1.0
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum BiometricError {
    #[error("no enrolled reference for {0}")]
    NotEnrolled(String),

    #[error("matcher unreachable: {0}")]
    Unreachable(String),

    #[error("bad sample: {0}")]
    BadSample(String),
}

/// Compares a captured sample against the student's enrolled reference
pub trait BiometricVerifier: Send + Sync {
    fn verify(&self, student_id: &str, sample: &[u8]) -> Result<BiometricMatch, BiometricError>;
}
