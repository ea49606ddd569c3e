//! AttendanceRecord: one student's participation state within one session
//!
//! The peer-edge list, peer count and trust score are only mutated through
//! methods that rescore in the same step, so the cached score can always
//! be re-derived from (peer count, biometric, override).

use super::scoring::{score_with, ScoringPolicy, TrustScore};
use super::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One half of a mutual peer acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerVerification {
    pub peer_id: String,
    pub peer_name: String,
    pub verified_at: DateTime<Utc>,
    /// Nonce of the token whose scan produced this edge
    pub nonce: String,
}

/// Output of the external face matcher, or a declined capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricResult {
    pub matched: bool,
    pub confidence: f64,
    pub skipped: bool,
    pub completed_at: DateTime<Utc>,
}

impl BiometricResult {
    pub fn completed(matched: bool, confidence: f64, at: DateTime<Utc>) -> Self {
        Self {
            matched,
            confidence,
            skipped: false,
            completed_at: at,
        }
    }

    pub fn skipped(at: DateTime<Utc>) -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            skipped: true,
            completed_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideDecision {
    Present,
    Absent,
}

/// A human decision that supersedes derived scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherOverride {
    pub decision: OverrideDecision,
    pub overridden_by: String,
    pub reason: Option<String>,
    pub overridden_at: DateTime<Utc>,
}

/// Result of trying to attach an edge to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeInsert {
    Added,
    Duplicate,
    SelfEdge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredRecord")]
pub struct AttendanceRecord {
    pub id: String,
    pub session_id: String,
    pub class_id: String,
    pub student_id: String,
    pub student_name: String,
    pub checked_in_at: DateTime<Utc>,
    peer_verifications: Vec<PeerVerification>,
    peer_count: usize,
    trust_score: TrustScore,
    teacher_override: Option<TeacherOverride>,
    biometric: Option<BiometricResult>,
}

/// Serialized shape of a record. The peer count is re-derived from the
/// edge list on load rather than trusted.
#[derive(Deserialize)]
struct StoredRecord {
    id: String,
    session_id: String,
    class_id: String,
    student_id: String,
    student_name: String,
    checked_in_at: DateTime<Utc>,
    #[serde(default)]
    peer_verifications: Vec<PeerVerification>,
    trust_score: TrustScore,
    teacher_override: Option<TeacherOverride>,
    biometric: Option<BiometricResult>,
}

impl From<StoredRecord> for AttendanceRecord {
    fn from(doc: StoredRecord) -> Self {
        Self {
            peer_count: doc.peer_verifications.len(),
            id: doc.id,
            session_id: doc.session_id,
            class_id: doc.class_id,
            student_id: doc.student_id,
            student_name: doc.student_name,
            checked_in_at: doc.checked_in_at,
            peer_verifications: doc.peer_verifications,
            trust_score: doc.trust_score,
            teacher_override: doc.teacher_override,
            biometric: doc.biometric,
        }
    }
}

impl AttendanceRecord {
    pub fn new(
        session: &Session,
        student_id: impl Into<String>,
        student_name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::provisional(session.id.clone(), student_id, student_name, at);
        record.class_id = session.class_id.clone();
        record
    }

    /// Client-side stand-in used while the store is unreachable. The class
    /// is unknown until the check-in replays.
    pub fn provisional(
        session_id: impl Into<String>,
        student_id: impl Into<String>,
        student_name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            class_id: String::new(),
            student_id: student_id.into(),
            student_name: student_name.into(),
            checked_in_at: at,
            peer_verifications: Vec::new(),
            peer_count: 0,
            trust_score: TrustScore::Absent,
            teacher_override: None,
            biometric: None,
        }
    }

    pub fn peer_verifications(&self) -> &[PeerVerification] {
        &self.peer_verifications
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    pub fn trust_score(&self) -> TrustScore {
        self.trust_score
    }

    pub fn teacher_override(&self) -> Option<&TeacherOverride> {
        self.teacher_override.as_ref()
    }

    pub fn biometric(&self) -> Option<&BiometricResult> {
        self.biometric.as_ref()
    }

    pub fn has_edge_to(&self, peer_id: &str) -> bool {
        self.peer_verifications.iter().any(|e| e.peer_id == peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.peer_verifications.iter().map(|e| e.peer_id.as_str())
    }

    /// Append an edge unless it duplicates a peer or points at the owner
    pub fn add_edge(&mut self, edge: PeerVerification, policy: &ScoringPolicy) -> EdgeInsert {
        if edge.peer_id == self.student_id {
            return EdgeInsert::SelfEdge;
        }
        if self.has_edge_to(&edge.peer_id) {
            return EdgeInsert::Duplicate;
        }
        self.peer_verifications.push(edge);
        self.peer_count = self.peer_verifications.len();
        self.rescore(policy);
        EdgeInsert::Added
    }

    pub fn set_biometric(&mut self, result: BiometricResult, policy: &ScoringPolicy) {
        self.biometric = Some(result);
        self.rescore(policy);
    }

    pub fn set_override(&mut self, decision: TeacherOverride, policy: &ScoringPolicy) {
        self.teacher_override = Some(decision);
        self.rescore(policy);
    }

    pub fn clear_override(&mut self, policy: &ScoringPolicy) {
        self.teacher_override = None;
        self.rescore(policy);
    }

    /// Score this record would have if recomputed now
    pub fn derived_score(&self, policy: &ScoringPolicy) -> TrustScore {
        score_with(
            policy,
            self.peer_verifications.len(),
            self.biometric.as_ref(),
            self.teacher_override.as_ref().map(|o| o.decision),
        )
    }

    /// Re-derive the cached score; returns true if it changed
    pub fn rescore(&mut self, policy: &ScoringPolicy) -> bool {
        self.peer_count = self.peer_verifications.len();
        let derived = self.derived_score(policy);
        let changed = derived != self.trust_score;
        self.trust_score = derived;
        changed
    }

    /// Cached fields agree with the edge list and the scoring function
    pub fn is_consistent(&self, policy: &ScoringPolicy) -> bool {
        self.peer_count == self.peer_verifications.len() && self.trust_score == self.derived_score(policy)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({}) | peers={} | trust={} | biometric={} | override={}",
            self.student_name,
            self.student_id,
            self.peer_count,
            self.trust_score,
            match &self.biometric {
                None => "none".to_string(),
                Some(b) if b.skipped => "skipped".to_string(),
                Some(b) => format!("{}@{:.2}", if b.matched { "match" } else { "no-match" }, b.confidence),
            },
            self.teacher_override
                .as_ref()
                .map(|o| format!("{:?}", o.decision).to_lowercase())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}
