//! Fraud Pattern Detector: batch analysis of co-verification across sessions
//!
//! Builds, per student, a count of how many sessions each peer appeared in
//! their edge set, then flags:
//! - pairs that co-verify in at least ceil(ratio × sessions) sessions
//! - students whose distinct-peer set stays tiny across many sessions
//!
//! Iteration runs over ordered maps so identical input yields identical
//! output, pattern order included.

use super::report::{FraudReport, PatternKind, Severity, SuspiciousPattern};
use crate::attendance::AttendanceRecord;
use crate::config::ProtocolConfig;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Thresholds for the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FraudPolicy {
    pub pair_ratio: f64,
    pub min_sessions: usize,
    pub low_peer_max_distinct: usize,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            pair_ratio: 0.8,
            min_sessions: 3,
            low_peer_max_distinct: 1,
        }
    }
}

impl From<&ProtocolConfig> for FraudPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            pair_ratio: config.fraud_pair_ratio,
            min_sessions: config.fraud_min_sessions,
            low_peer_max_distinct: config.low_peer_max_distinct,
        }
    }
}

impl FraudPolicy {
    /// Co-verification count a pair needs to be flagged
    pub fn pair_threshold(&self, total_sessions: usize) -> usize {
        // Small epsilon keeps e.g. 0.8 × 10 from rounding up to 9
        ((self.pair_ratio * total_sessions as f64) - 1e-9).ceil().max(1.0) as usize
    }
}

/// The peer graph of one ended session: student → peers they hold edges to
#[derive(Debug, Clone, Default)]
pub struct SessionGraph {
    pub session_id: String,
    pub edges: BTreeMap<String, BTreeSet<String>>,
}

impl SessionGraph {
    pub fn from_records(session_id: impl Into<String>, records: &[AttendanceRecord]) -> Self {
        let mut edges = BTreeMap::new();
        for record in records {
            let peers: BTreeSet<String> = record.peer_ids().map(str::to_string).collect();
            edges.insert(record.student_id.clone(), peers);
        }
        Self {
            session_id: session_id.into(),
            edges,
        }
    }
}

/// Run the analysis. Pure: the caller persists the report.
pub fn detect(
    class_id: &str,
    graphs: &[SessionGraph],
    policy: &FraudPolicy,
    generated_at: DateTime<Utc>,
) -> FraudReport {
    let total = graphs.len();
    let mut patterns = Vec::new();

    if total >= policy.min_sessions {
        let mut co_counts: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
        let mut attended: BTreeMap<&str, usize> = BTreeMap::new();
        let mut distinct: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for graph in graphs {
            for (student, peers) in &graph.edges {
                *attended.entry(student.as_str()).or_default() += 1;
                let seen = distinct.entry(student.as_str()).or_default();
                let counts = co_counts.entry(student.as_str()).or_default();
                for peer in peers {
                    if peer == student {
                        continue;
                    }
                    *counts.entry(peer.as_str()).or_default() += 1;
                    seen.insert(peer.as_str());
                }
            }
        }

        let threshold = policy.pair_threshold(total);
        let mut reported: BTreeSet<(&str, &str)> = BTreeSet::new();
        let lookup = |a: &str, b: &str| {
            co_counts
                .get(a)
                .and_then(|m| m.get(b))
                .copied()
                .unwrap_or(0)
        };

        for (student, peers) in &co_counts {
            for peer in peers.keys() {
                let key = if student < peer { (*student, *peer) } else { (*peer, *student) };
                if !reported.insert(key) {
                    continue;
                }
                // Edges are symmetric by construction; take the larger side if a half-write was lost
                let count = lookup(key.0, key.1).max(lookup(key.1, key.0));
                if count < threshold {
                    continue;
                }
                let severity = if count == total { Severity::High } else { Severity::Medium };
                patterns.push(SuspiciousPattern {
                    kind: PatternKind::AlwaysSamePeers,
                    student_ids: vec![key.0.to_string(), key.1.to_string()],
                    description: format!(
                        "{} and {} verified each other in {} of {} sessions",
                        key.0, key.1, count, total
                    ),
                    severity,
                });
            }
        }
        patterns.sort_by(|a, b| a.student_ids.cmp(&b.student_ids));

        let isolated: Vec<String> = attended
            .iter()
            .filter(|(student, sessions)| {
                **sessions >= policy.min_sessions
                    && distinct.get(*student).map(|s| s.len()).unwrap_or(0)
                        <= policy.low_peer_max_distinct
            })
            .map(|(student, _)| student.to_string())
            .collect();

        if !isolated.is_empty() {
            patterns.push(SuspiciousPattern {
                kind: PatternKind::LowPeerCount,
                description: format!(
                    "{} student(s) verified with at most {} distinct peer(s) across {}+ sessions",
                    isolated.len(),
                    policy.low_peer_max_distinct,
                    policy.min_sessions
                ),
                student_ids: isolated,
                severity: Severity::Medium,
            });
        }
    }

    let summary = if total < policy.min_sessions {
        format!(
            "Analyzed {} session(s) for class {}: at least {} ended sessions are needed",
            total, class_id, policy.min_sessions
        )
    } else if patterns.is_empty() {
        format!("Analyzed {} sessions for class {}: no suspicious patterns", total, class_id)
    } else {
        let high = patterns.iter().filter(|p| p.severity == Severity::High).count();
        format!(
            "Analyzed {} sessions for class {}: {} suspicious pattern(s), {} high severity",
            total,
            class_id,
            patterns.len(),
            high
        )
    };

    FraudReport {
        id: Uuid::new_v4().to_string(),
        class_id: class_id.to_string(),
        generated_at,
        sessions_analyzed: total,
        patterns,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(id: &str, pairs: &[(&str, &str)], loners: &[&str]) -> SessionGraph {
        let mut g = SessionGraph {
            session_id: id.to_string(),
            edges: BTreeMap::new(),
        };
        for (a, b) in pairs {
            g.edges.entry(a.to_string()).or_default().insert(b.to_string());
            g.edges.entry(b.to_string()).or_default().insert(a.to_string());
        }
        for l in loners {
            g.edges.entry(l.to_string()).or_default();
        }
        g
    }

    #[test]
    fn test_pair_in_every_session_is_high() {
        let graphs: Vec<SessionGraph> = (0..3)
            .map(|i| graph(&format!("s{}", i), &[("x", "y")], &[]))
            .collect();
        let report = detect("class", &graphs, &FraudPolicy::default(), Utc::now());

        let pairs: Vec<_> = report.patterns_of(PatternKind::AlwaysSamePeers).collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].severity, Severity::High);
        assert_eq!(pairs[0].student_ids, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(report.sessions_analyzed, 3);
    }

    #[test]
    fn test_pair_in_most_sessions_is_medium() {
        // 4 of 5 sessions meets ceil(0.8 * 5) = 4
        let mut graphs: Vec<SessionGraph> = (0..4)
            .map(|i| graph(&format!("s{}", i), &[("a", "b"), ("a", "c"), ("b", "d")], &[]))
            .collect();
        graphs.push(graph("s4", &[("a", "c"), ("b", "d"), ("c", "d")], &[]));

        let report = detect("class", &graphs, &FraudPolicy::default(), Utc::now());
        let ab = report
            .patterns_of(PatternKind::AlwaysSamePeers)
            .find(|p| p.student_ids == vec!["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(ab.severity, Severity::Medium);
        let ac = report
            .patterns_of(PatternKind::AlwaysSamePeers)
            .find(|p| p.student_ids == vec!["a".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(ac.severity, Severity::High);
        assert_eq!(report.patterns_of(PatternKind::AlwaysSamePeers).count(), 3);
    }

    #[test]
    fn test_too_few_sessions() {
        let graphs = vec![graph("s0", &[("x", "y")], &[]), graph("s1", &[("x", "y")], &[])];
        let report = detect("class", &graphs, &FraudPolicy::default(), Utc::now());
        assert!(report.is_clean());
    }

    #[test]
    fn test_low_peer_count_groups_students() {
        let graphs: Vec<SessionGraph> = (0..3)
            .map(|i| {
                let pairs: Vec<(&str, &str)> = if i == 0 {
                    vec![("a", "b"), ("a", "c"), ("b", "c")]
                } else {
                    vec![("a", "d"), ("b", "d"), ("c", "d")]
                };
                graph(&format!("s{}", i), &pairs, &["loner"])
            })
            .collect();

        let report = detect("class", &graphs, &FraudPolicy::default(), Utc::now());
        let low: Vec<_> = report.patterns_of(PatternKind::LowPeerCount).collect();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].student_ids, vec!["loner".to_string()]);
        assert_eq!(low[0].severity, Severity::Medium);
        assert_eq!(report.patterns_of(PatternKind::AlwaysSamePeers).count(), 0);
    }

    #[test]
    fn test_deterministic_output() {
        let graphs: Vec<SessionGraph> = (0..4)
            .map(|i| graph(&format!("s{}", i), &[("m", "n"), ("p", "q"), ("a", "z")], &[]))
            .collect();
        let r1 = detect("class", &graphs, &FraudPolicy::default(), Utc::now());
        let r2 = detect("class", &graphs, &FraudPolicy::default(), Utc::now());
        assert_eq!(r1.patterns, r2.patterns);
        assert_eq!(r1.patterns[0].student_ids, vec!["a".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_pair_threshold() {
        let policy = FraudPolicy::default();
        assert_eq!(policy.pair_threshold(3), 3);
        assert_eq!(policy.pair_threshold(5), 4);
        assert_eq!(policy.pair_threshold(10), 8);
    }
}
