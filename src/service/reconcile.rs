//! Biometric results, teacher overrides and batch recompute
//!
//! Each single-record change is a conditional read-modify-write under
//! [`with_retry`]; the record's own setters rescore in the same step.
//! `recompute_all` writes its batch through the store's atomic multi-record
//! update so a half-reconciled session is never visible.

use super::biometric::BiometricVerifier;
use super::notify::{ChangeEvent, ChangeKind};
use super::{short, AttendanceService};
use crate::attendance::{AttendanceRecord, BiometricResult, OverrideDecision, TeacherOverride};
use crate::error::AttendanceError;
use crate::storage::with_retry;
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub session_id: String,
    pub student_id: String,
    pub requester_id: String,
    pub decision: OverrideDecision,
    pub reason: Option<String>,
}

impl AttendanceService {
    /// Store a matcher result (or a declined capture) and rescore
    pub fn record_biometric(
        &self,
        session_id: &str,
        student_id: &str,
        result: BiometricResult,
    ) -> Result<AttendanceRecord, AttendanceError> {
        if !result.confidence.is_finite() || !(0.0..=1.0).contains(&result.confidence) {
            return Err(AttendanceError::Validation {
                field: "confidence",
                reason: format!("{} is outside [0, 1]", result.confidence),
            });
        }
        self.load_session(session_id)?;

        let record = self.modify_record(session_id, student_id, |record| {
            record.set_biometric(result.clone(), &self.scoring);
            Ok(())
        })?;
        info!(
            "Biometric for {} in session {}: {}",
            student_id,
            short(session_id),
            record.trust_score()
        );
        self.publish_record(ChangeKind::BiometricRecorded, &record);
        Ok(record)
    }

    /// Ask the external matcher, then record its answer. A matcher failure
    /// leaves the record untouched.
    pub fn run_biometric(
        &self,
        session_id: &str,
        student_id: &str,
        verifier: &dyn BiometricVerifier,
        sample: &[u8],
    ) -> Result<AttendanceRecord, AttendanceError> {
        if self.store.get_record(session_id, student_id)?.is_none() {
            return Err(AttendanceError::NotCheckedIn {
                session_id: session_id.to_string(),
                student_id: student_id.to_string(),
            });
        }
        let verdict = verifier.verify(student_id, sample).map_err(|e| {
            warn!("Biometric matcher failed for {}: {}", student_id, e);
            AttendanceError::BiometricUnavailable(e.to_string())
        })?;
        self.record_biometric(
            session_id,
            student_id,
            BiometricResult::completed(verdict.matched, verdict.confidence, self.clock.now()),
        )
    }

    /// Pin a record to present or absent. Allowed after the session ended.
    pub fn set_override(&self, req: &OverrideRequest) -> Result<AttendanceRecord, AttendanceError> {
        AttendanceError::required("requester_id", &req.requester_id)?;
        self.require_authority(&req.session_id, &req.requester_id)?;

        let record = self.modify_record(&req.session_id, &req.student_id, |record| {
            record.set_override(
                TeacherOverride {
                    decision: req.decision,
                    overridden_by: req.requester_id.clone(),
                    reason: req.reason.clone(),
                    overridden_at: self.clock.now(),
                },
                &self.scoring,
            );
            Ok(())
        })?;
        info!(
            "Override {:?} on {} in session {} by {}",
            req.decision,
            req.student_id,
            short(&req.session_id),
            req.requester_id
        );
        self.publish_record(ChangeKind::OverrideSet, &record);
        Ok(record)
    }

    pub fn clear_override(
        &self,
        session_id: &str,
        student_id: &str,
        requester_id: &str,
    ) -> Result<AttendanceRecord, AttendanceError> {
        self.require_authority(session_id, requester_id)?;
        let record = self.modify_record(session_id, student_id, |record| {
            record.clear_override(&self.scoring);
            Ok(())
        })?;
        info!("Override cleared on {} in session {}", student_id, short(session_id));
        self.publish_record(ChangeKind::OverrideCleared, &record);
        Ok(record)
    }

    /// Re-derive every non-overridden record's score in one atomic batch.
    /// Returns how many records changed.
    pub fn recompute_all(&self, session_id: &str) -> Result<usize, AttendanceError> {
        self.load_session(session_id)?;

        let changed = with_retry(&self.retry, session_id, || {
            let mut batch = Vec::new();
            for doc in self.store.records_for_session(session_id)? {
                let mut record = doc.value;
                if record.teacher_override().is_some() {
                    continue;
                }
                if record.rescore(&self.scoring) {
                    batch.push((record, doc.version));
                }
            }
            if !batch.is_empty() {
                self.store.update_records(batch.clone())?;
            }
            Ok(batch)
        })?;

        info!(
            "Recomputed session {}: {} record(s) changed",
            short(session_id),
            changed.len()
        );
        for (record, _) in &changed {
            self.publish_record(ChangeKind::Recomputed, record);
        }
        Ok(changed.len())
    }

    fn require_authority(&self, session_id: &str, requester_id: &str) -> Result<(), AttendanceError> {
        let session = self.load_session(session_id)?.value;
        if session.authority_id != requester_id {
            return Err(AttendanceError::PermissionDenied(requester_id.to_string()));
        }
        Ok(())
    }

    fn modify_record<F>(&self, session_id: &str, student_id: &str, mut change: F) -> Result<AttendanceRecord, AttendanceError>
    where
        F: FnMut(&mut AttendanceRecord) -> Result<(), AttendanceError>,
    {
        let key = format!("{}/{}", session_id, student_id);
        with_retry(&self.retry, &key, || {
            let current = self
                .store
                .get_record(session_id, student_id)?
                .ok_or_else(|| AttendanceError::NotCheckedIn {
                    session_id: session_id.to_string(),
                    student_id: student_id.to_string(),
                })?;
            let mut record = current.value;
            change(&mut record)?;
            self.store.update_record(record.clone(), current.version)?;
            Ok(record)
        })
    }

    fn publish_record(&self, kind: ChangeKind, record: &AttendanceRecord) {
        self.hub.publish(ChangeEvent {
            kind,
            session_id: record.session_id.clone(),
            student_id: Some(record.student_id.clone()),
            trust_score: Some(record.trust_score()),
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::biometric::{BiometricError, BiometricMatch};
    use super::super::testkit::harness;
    use super::*;
    use crate::attendance::{PeerVerification, ScoringPolicy, TrustScore};
    use crate::storage::RecordStore;
    use chrono::Utc;

    struct FixedMatcher(Result<BiometricMatch, String>);

    impl BiometricVerifier for FixedMatcher {
        fn verify(&self, _student_id: &str, sample: &[u8]) -> Result<BiometricMatch, BiometricError> {
            if sample.is_empty() {
                return Err(BiometricError::BadSample("empty".into()));
            }
            self.0.clone().map_err(BiometricError::Unreachable)
        }
    }

    fn override_req(session_id: &str, student: &str, requester: &str, decision: OverrideDecision) -> OverrideRequest {
        OverrideRequest {
            session_id: session_id.to_string(),
            student_id: student.to_string(),
            requester_id: requester.to_string(),
            decision,
            reason: Some("seen in class".into()),
        }
    }

    #[test]
    fn test_failed_biometric_demotes_to_review() {
        let h = harness();
        let session = h.session_with("cs101", &["a", "b", "c", "d"]);
        for peer in ["b", "c", "d"] {
            h.scan(&session, "a", peer).unwrap();
        }
        assert_eq!(
            h.service.get_attendance(&session.id, "a").unwrap().unwrap().trust_score(),
            TrustScore::Present
        );

        let record = h
            .service
            .record_biometric(&session.id, "a", BiometricResult::completed(false, 0.1, Utc::now()))
            .unwrap();
        assert_eq!(record.trust_score(), TrustScore::Review);

        let record = h
            .service
            .record_biometric(&session.id, "a", BiometricResult::skipped(Utc::now()))
            .unwrap();
        assert_eq!(record.trust_score(), TrustScore::Present);
    }

    #[test]
    fn test_biometric_validation() {
        let h = harness();
        let session = h.session_with("cs101", &["a"]);
        for bad in [1.5, -0.1, f64::NAN] {
            assert!(matches!(
                h.service
                    .record_biometric(&session.id, "a", BiometricResult::completed(true, bad, Utc::now())),
                Err(AttendanceError::Validation { field: "confidence", .. })
            ));
        }
        assert!(matches!(
            h.service
                .record_biometric(&session.id, "ghost", BiometricResult::skipped(Utc::now())),
            Err(AttendanceError::NotCheckedIn { .. })
        ));
    }

    #[test]
    fn test_run_biometric() {
        let h = harness();
        let session = h.session_with("cs101", &["a"]);

        let good = FixedMatcher(Ok(BiometricMatch {
            matched: true,
            confidence: 0.9,
        }));
        let record = h.service.run_biometric(&session.id, "a", &good, b"jpeg").unwrap();
        assert!(record.biometric().unwrap().matched);

        let down = FixedMatcher(Err("timeout".into()));
        let err = h.service.run_biometric(&session.id, "a", &down, b"jpeg").unwrap_err();
        assert!(matches!(err, AttendanceError::BiometricUnavailable(_)));
        assert!(err.is_infrastructure());

        // Previous result untouched
        let stored = h.service.get_attendance(&session.id, "a").unwrap().unwrap();
        assert_eq!(stored.biometric().unwrap().confidence, 0.9);
    }

    #[test]
    fn test_override_precedence_and_clear() {
        let h = harness();
        let session = h.session_with("cs101", &["a", "b", "c"]);
        h.scan(&session, "a", "b").unwrap();

        let record = h
            .service
            .set_override(&override_req(&session.id, "a", "teacher", OverrideDecision::Absent))
            .unwrap();
        assert_eq!(record.trust_score(), TrustScore::Absent);
        assert_eq!(record.teacher_override().unwrap().overridden_by, "teacher");

        // Edges keep accruing but the override still wins
        h.scan(&session, "c", "a").unwrap();
        let after = h.service.get_attendance(&session.id, "a").unwrap().unwrap();
        assert_eq!(after.peer_count(), 2);
        assert_eq!(after.trust_score(), TrustScore::Absent);

        let cleared = h.service.clear_override(&session.id, "a", "teacher").unwrap();
        assert_eq!(cleared.trust_score(), TrustScore::Review);
        assert!(cleared.is_consistent(h.service.scoring_policy()));
    }

    #[test]
    fn test_override_permissions() {
        let h = harness();
        let session = h.session_with("cs101", &["a"]);
        assert!(matches!(
            h.service
                .set_override(&override_req(&session.id, "a", "a", OverrideDecision::Present)),
            Err(AttendanceError::PermissionDenied(_))
        ));
        assert!(matches!(
            h.service.clear_override(&session.id, "a", "mallory"),
            Err(AttendanceError::PermissionDenied(_))
        ));

        // Overrides are accepted after the session ended
        h.service.end_session(&session.id, "teacher").unwrap();
        let record = h
            .service
            .set_override(&override_req(&session.id, "a", "teacher", OverrideDecision::Present))
            .unwrap();
        assert_eq!(record.trust_score(), TrustScore::Present);
    }

    #[test]
    fn test_recompute_all_repairs_stale_scores() {
        let h = harness();
        let session = h.session_with("cs101", &["a", "b", "c"]);

        // Store records scored under a looser threshold, as an older build would have
        let loose = ScoringPolicy {
            peer_threshold: 1,
            ..ScoringPolicy::default()
        };
        for (owner, peer) in [("a", "b"), ("b", "a")] {
            let doc = h.store.get_record(&session.id, owner).unwrap().unwrap();
            let mut record = doc.value;
            record.add_edge(
                PeerVerification {
                    peer_id: peer.into(),
                    peer_name: peer.to_uppercase(),
                    verified_at: Utc::now(),
                    nonce: "n".into(),
                },
                &loose,
            );
            assert_eq!(record.trust_score(), TrustScore::Present);
            h.store.update_record(record, doc.version).unwrap();
        }
        h.service
            .set_override(&override_req(&session.id, "b", "teacher", OverrideDecision::Present))
            .unwrap();

        // b is pinned by the override; only a changes
        assert_eq!(h.service.recompute_all(&session.id).unwrap(), 1);
        let a = h.service.get_attendance(&session.id, "a").unwrap().unwrap();
        assert_eq!(a.trust_score(), TrustScore::Review);
        let b = h.service.get_attendance(&session.id, "b").unwrap().unwrap();
        assert_eq!(b.trust_score(), TrustScore::Present);

        assert_eq!(h.service.recompute_all(&session.id).unwrap(), 0);
        for record in h.service.session_attendance(&session.id).unwrap() {
            assert!(record.is_consistent(h.service.scoring_policy()));
        }
    }

    #[test]
    fn test_recompute_all_is_atomic_under_outage() {
        let h = harness();
        let session = h.session_with("cs101", &["a"]);
        h.store.set_online(false);
        let err = h.service.recompute_all(&session.id).unwrap_err();
        assert!(err.is_infrastructure());
        h.store.set_online(true);
        assert!(matches!(
            h.service.recompute_all("missing"),
            Err(AttendanceError::SessionNotFound(_))
        ));
    }
}
