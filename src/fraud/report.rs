//! Fraud report types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// A pair of students who verify each other in nearly every session
    AlwaysSamePeers,
    /// Students who never verify with more than a handful of peers
    LowPeerCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousPattern {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub student_ids: Vec<String>,
    pub description: String,
    pub severity: Severity,
}

/// Output of one analysis run. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudReport {
    pub id: String,
    pub class_id: String,
    pub generated_at: DateTime<Utc>,
    pub sessions_analyzed: usize,
    pub patterns: Vec<SuspiciousPattern>,
    pub summary: String,
}

impl FraudReport {
    pub fn patterns_of(&self, kind: PatternKind) -> impl Iterator<Item = &SuspiciousPattern> {
        self.patterns.iter().filter(move |p| p.kind == kind)
    }

    pub fn is_clean(&self) -> bool {
        self.patterns.is_empty()
    }
}
