//! Trust scoring: the single derivation path for a record's trust class
//!
//! Precedence, highest first:
//! 1. A teacher override decides outright
//! 2. Enough peers plus a passing (or skipped/absent) biometric → present
//! 3. Enough peers but a failed biometric attempt → review
//! 4. At least one peer → review
//! 5. Otherwise → absent

use super::record::{BiometricResult, OverrideDecision};
use crate::config::ProtocolConfig;
use serde::{Deserialize, Serialize};

/// Derived credibility classification of an attendance record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustScore {
    Present,
    Review,
    Absent,
}

impl TrustScore {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustScore::Present => "present",
            TrustScore::Review => "review",
            TrustScore::Absent => "absent",
        }
    }
}

impl std::fmt::Display for TrustScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds used by [`score_with`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub peer_threshold: usize,
    pub min_confidence: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            peer_threshold: 3,
            min_confidence: 0.70,
        }
    }
}

impl From<&ProtocolConfig> for ScoringPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            peer_threshold: config.peer_threshold,
            min_confidence: config.biometric_min_confidence,
        }
    }
}

/// Score with the default policy
pub fn score(
    peer_count: usize,
    biometric: Option<&BiometricResult>,
    override_decision: Option<OverrideDecision>,
) -> TrustScore {
    score_with(&ScoringPolicy::default(), peer_count, biometric, override_decision)
}

pub fn score_with(
    policy: &ScoringPolicy,
    peer_count: usize,
    biometric: Option<&BiometricResult>,
    override_decision: Option<OverrideDecision>,
) -> TrustScore {
    if let Some(decision) = override_decision {
        return match decision {
            OverrideDecision::Present => TrustScore::Present,
            OverrideDecision::Absent => TrustScore::Absent,
        };
    }

    let peer_ok = peer_count >= policy.peer_threshold;
    let attempted = biometric.filter(|b| !b.skipped);
    let bio_ok = attempted
        .map(|b| b.matched && b.confidence >= policy.min_confidence)
        .unwrap_or(false);

    match (peer_ok, attempted) {
        (true, None) => TrustScore::Present,
        (true, Some(_)) if bio_ok => TrustScore::Present,
        (true, Some(_)) => TrustScore::Review,
        (false, _) if peer_count >= 1 => TrustScore::Review,
        _ => TrustScore::Absent,
    }
}
