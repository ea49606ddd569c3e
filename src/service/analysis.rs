//! Fraud analysis over a class's ended sessions
//!
//! Reads every ended session's graph, runs the detector, then appends the
//! report. Any read failure aborts before the append, so an incomplete
//! report is never stored.

use super::AttendanceService;
use crate::attendance::SessionStatus;
use crate::error::AttendanceError;
use crate::fraud::{detect, FraudPolicy, FraudReport, SessionGraph};
use log::info;

impl AttendanceService {
    pub fn analyze_fraud(&self, class_id: &str) -> Result<FraudReport, AttendanceError> {
        AttendanceError::required("class_id", class_id)?;

        let mut graphs = Vec::new();
        for session in self.store.sessions_for_class(class_id)? {
            if session.status != SessionStatus::Ended {
                continue;
            }
            let records: Vec<_> = self
                .store
                .records_for_session(&session.id)?
                .into_iter()
                .map(|v| v.value)
                .collect();
            graphs.push(SessionGraph::from_records(session.id, &records));
        }

        let policy = FraudPolicy::from(&self.config);
        let report = detect(class_id, &graphs, &policy, self.clock.now());
        self.store.append_fraud_report(report.clone())?;

        info!(
            "Fraud report for {}: {} pattern(s) over {} session(s)",
            class_id,
            report.patterns.len(),
            report.sessions_analyzed
        );
        Ok(report)
    }

    /// Reports previously stored for a class, oldest first
    pub fn fraud_reports(&self, class_id: &str) -> Result<Vec<FraudReport>, AttendanceError> {
        Ok(self.store.fraud_reports(class_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::harness;
    use crate::fraud::{PatternKind, Severity};

    #[test]
    fn test_pair_in_every_session_is_flagged() {
        let h = harness();
        for i in 0..3 {
            let others = [format!("o{}a", i), format!("o{}b", i)];
            let session = h.session_with("cs101", &["x", "y", others[0].as_str(), others[1].as_str()]);
            h.scan(&session, "x", "y").unwrap();
            h.scan(&session, &others[0], &others[1]).unwrap();
            h.service.end_session(&session.id, "teacher").unwrap();
        }

        let report = h.service.analyze_fraud("cs101").unwrap();
        assert_eq!(report.sessions_analyzed, 3);
        let pairs: Vec<_> = report.patterns_of(PatternKind::AlwaysSamePeers).collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].student_ids, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(pairs[0].severity, Severity::High);

        assert_eq!(h.service.fraud_reports("cs101").unwrap().len(), 1);
    }

    #[test]
    fn test_active_sessions_are_ignored() {
        let h = harness();
        for _ in 0..2 {
            let session = h.session_with("cs101", &["x", "y"]);
            h.scan(&session, "x", "y").unwrap();
            h.service.end_session(&session.id, "teacher").unwrap();
        }
        let live = h.session_with("cs101", &["x", "y"]);
        h.scan(&live, "x", "y").unwrap();

        let report = h.service.analyze_fraud("cs101").unwrap();
        assert_eq!(report.sessions_analyzed, 2);
        assert!(report.is_clean());
    }

    #[test]
    fn test_outage_leaves_no_partial_report() {
        let h = harness();
        let session = h.session_with("cs101", &["x"]);
        h.service.end_session(&session.id, "teacher").unwrap();

        h.store.set_online(false);
        assert!(h.service.analyze_fraud("cs101").unwrap_err().is_infrastructure());
        h.store.set_online(true);
        assert!(h.service.fraud_reports("cs101").unwrap().is_empty());
    }
}
