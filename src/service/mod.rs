//! Attendance service: the protocol's operations over an injected store
//!
//! One `AttendanceService` is shared (behind an `Arc`) by all request
//! contexts. It holds no mutable protocol state of its own: every
//! read-modify-write goes through the store's conditional updates.
//!
//! - `registry`: session lifecycle and token issuance
//! - `checkin`: idempotent check-in state machine
//! - `peer`: bidirectional peer verification
//! - `reconcile`: biometric results, overrides, batch recompute
//! - `analysis`: fraud-pattern runs over ended sessions

mod analysis;
mod biometric;
mod checkin;
mod limiter;
mod notify;
mod peer;
mod reconcile;
mod registry;

pub use biometric::{BiometricError, BiometricMatch, BiometricVerifier};
pub use checkin::CheckInRequest;
pub use limiter::{FixedWindowLimiter, RateLimiter, Unlimited};
pub use notify::{ChangeEvent, ChangeHub, ChangeKind, Subscription, Topic};
pub use peer::{PeerOutcome, PeerScanRequest};
pub use reconcile::OverrideRequest;

use crate::attendance::{AttendanceRecord, ScoringPolicy, Session, TrustScore};
use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::AttendanceError;
use crate::storage::{RecordStore, RetryPolicy, Versioned};
use crate::token::TokenCodec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Trust-class counts for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total: usize,
    pub present: usize,
    pub review: usize,
    pub absent: usize,
    pub overridden: usize,
}

pub struct AttendanceService {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: ProtocolConfig,
    codec: TokenCodec,
    scoring: ScoringPolicy,
    retry: RetryPolicy,
    limiter: Arc<dyn RateLimiter>,
    hub: ChangeHub,
}

impl AttendanceService {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, config: ProtocolConfig) -> Self {
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit_per_window,
            config.rate_limit_window_secs,
            clock.clone(),
        ));
        Self {
            codec: TokenCodec::new(config.token_ttl_ms, clock.clone()),
            scoring: ScoringPolicy::from(&config),
            retry: RetryPolicy::from(&config),
            store,
            clock,
            config,
            limiter,
            hub: ChangeHub::new(),
        }
    }

    /// Replace the default fixed-window limiter
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn scoring_policy(&self) -> &ScoringPolicy {
        &self.scoring
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Current time on the service's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Change notifications for a session or a student
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.hub.subscribe(topic)
    }

    /// Is the authoritative store reachable?
    pub fn health(&self) -> Result<(), AttendanceError> {
        Ok(self.store.ping()?)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, AttendanceError> {
        Ok(self.load_session(session_id)?.value)
    }

    pub fn get_attendance(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        Ok(self
            .store
            .get_record(session_id, student_id)?
            .map(|v| self.fresh(v.value)))
    }

    /// All records of a session in check-in order
    pub fn session_attendance(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let mut records: Vec<AttendanceRecord> = self
            .store
            .records_for_session(session_id)?
            .into_iter()
            .map(|v| self.fresh(v.value))
            .collect();
        records.sort_by(|a, b| {
            a.checked_in_at
                .cmp(&b.checked_in_at)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });
        Ok(records)
    }

    pub fn student_history(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        Ok(self
            .store
            .records_for_student(student_id)?
            .into_iter()
            .map(|r| self.fresh(r))
            .collect())
    }

    pub fn session_summary(&self, session_id: &str) -> Result<SessionSummary, AttendanceError> {
        self.load_session(session_id)?;
        let mut summary = SessionSummary {
            session_id: session_id.to_string(),
            ..Default::default()
        };
        for record in self.session_attendance(session_id)? {
            summary.total += 1;
            match record.trust_score() {
                TrustScore::Present => summary.present += 1,
                TrustScore::Review => summary.review += 1,
                TrustScore::Absent => summary.absent += 1,
            }
            if record.teacher_override().is_some() {
                summary.overridden += 1;
            }
        }
        Ok(summary)
    }

    /// Records handed to callers always carry the score this service's
    /// policy derives, whatever was cached in the stored document
    fn fresh(&self, mut record: AttendanceRecord) -> AttendanceRecord {
        record.rescore(&self.scoring);
        record
    }

    fn load_session(&self, session_id: &str) -> Result<Versioned<Session>, AttendanceError> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| AttendanceError::SessionNotFound(session_id.to_string()))
    }

    fn load_active_session(&self, session_id: &str) -> Result<Session, AttendanceError> {
        let session = self.load_session(session_id)?.value;
        if !session.is_active() {
            return Err(AttendanceError::SessionNotActive(session_id.to_string()));
        }
        Ok(session)
    }

    fn rate_check(&self, key: String) -> Result<(), AttendanceError> {
        if self.limiter.check(&key) {
            Ok(())
        } else {
            Err(AttendanceError::RateLimited(key))
        }
    }
}

/// First 8 characters of an id, for log lines
pub(crate) fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fraud::FraudReport;
    use crate::storage::{Inserted, MemoryStore, StoreError};
    use std::sync::Mutex;

    pub struct Harness<S = MemoryStore> {
        pub service: Arc<AttendanceService>,
        pub store: Arc<S>,
        pub clock: Arc<ManualClock>,
    }

    pub fn harness() -> Harness {
        harness_with(ProtocolConfig {
            retry_backoff_ms: 0,
            ..Default::default()
        })
    }

    pub fn harness_with(config: ProtocolConfig) -> Harness {
        build(Arc::new(MemoryStore::new()), config)
    }

    /// Harness whose store can end a session between a caller's checks
    /// and its write
    pub fn racing_harness() -> Harness<EndingStore> {
        build(
            Arc::new(EndingStore::new()),
            ProtocolConfig {
                retry_backoff_ms: 0,
                ..Default::default()
            },
        )
    }

    fn build<S: RecordStore + 'static>(store: Arc<S>, config: ProtocolConfig) -> Harness<S> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let service = Arc::new(
            AttendanceService::new(store.clone(), clock.clone(), config)
                .with_rate_limiter(Arc::new(Unlimited)),
        );
        Harness { service, store, clock }
    }

    /// Memory store that, once armed, ends a session immediately before
    /// the next session-guarded record write
    pub struct EndingStore {
        inner: MemoryStore,
        armed: Mutex<Option<String>>,
    }

    impl EndingStore {
        pub fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                armed: Mutex::new(None),
            }
        }

        pub fn end_before_next_write(&self, session_id: &str) {
            *self.armed.lock().unwrap() = Some(session_id.to_string());
        }

        fn fire(&self) {
            if let Some(id) = self.armed.lock().unwrap().take() {
                let doc = self.inner.get_session(&id).unwrap().unwrap();
                let mut session = doc.value;
                session.end(chrono::Utc::now());
                self.inner.update_session(session, doc.version).unwrap();
            }
        }
    }

    impl RecordStore for EndingStore {
        fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping()
        }
        fn get_session(&self, session_id: &str) -> Result<Option<Versioned<Session>>, StoreError> {
            self.inner.get_session(session_id)
        }
        fn create_session(&self, session: Session) -> Result<Versioned<Session>, StoreError> {
            self.inner.create_session(session)
        }
        fn update_session(&self, session: Session, expected_version: u64) -> Result<u64, StoreError> {
            self.inner.update_session(session, expected_version)
        }
        fn active_session_for_class(&self, class_id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.active_session_for_class(class_id)
        }
        fn sessions_for_class(&self, class_id: &str) -> Result<Vec<Session>, StoreError> {
            self.inner.sessions_for_class(class_id)
        }
        fn active_sessions(&self) -> Result<Vec<Session>, StoreError> {
            self.inner.active_sessions()
        }
        fn get_record(
            &self,
            session_id: &str,
            student_id: &str,
        ) -> Result<Option<Versioned<AttendanceRecord>>, StoreError> {
            self.inner.get_record(session_id, student_id)
        }
        fn insert_record(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError> {
            self.inner.insert_record(record)
        }
        fn insert_record_while_active(
            &self,
            record: AttendanceRecord,
        ) -> Result<Inserted<AttendanceRecord>, StoreError> {
            self.fire();
            self.inner.insert_record_while_active(record)
        }
        fn update_record(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError> {
            self.inner.update_record(record, expected_version)
        }
        fn update_record_while_active(
            &self,
            record: AttendanceRecord,
            expected_version: u64,
        ) -> Result<u64, StoreError> {
            self.fire();
            self.inner.update_record_while_active(record, expected_version)
        }
        fn update_records(&self, updates: Vec<(AttendanceRecord, u64)>) -> Result<(), StoreError> {
            self.inner.update_records(updates)
        }
        fn records_for_session(&self, session_id: &str) -> Result<Vec<Versioned<AttendanceRecord>>, StoreError> {
            self.inner.records_for_session(session_id)
        }
        fn records_for_student(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.inner.records_for_student(student_id)
        }
        fn append_fraud_report(&self, report: FraudReport) -> Result<(), StoreError> {
            self.inner.append_fraud_report(report)
        }
        fn fraud_reports(&self, class_id: &str) -> Result<Vec<FraudReport>, StoreError> {
            self.inner.fraud_reports(class_id)
        }
    }

    impl<S> Harness<S> {
        /// Start a session and check every student in
        pub fn session_with(&self, class_id: &str, students: &[&str]) -> Session {
            let session = self.service.start_session(class_id, "teacher").unwrap();
            for s in students {
                self.service
                    .check_in(&CheckInRequest {
                        session_id: session.id.clone(),
                        student_id: s.to_string(),
                        student_name: s.to_uppercase(),
                        token: None,
                    })
                    .unwrap();
            }
            session
        }

        pub fn scan(&self, session: &Session, scanner: &str, peer: &str) -> Result<PeerOutcome, AttendanceError> {
            let token = self.service.issue_participant_token(&session.id, peer)?;
            self.service.verify_peer(&PeerScanRequest {
                session_id: session.id.clone(),
                scanner_id: scanner.to_string(),
                scanner_name: scanner.to_uppercase(),
                peer_id: peer.to_string(),
                peer_name: peer.to_uppercase(),
                token,
            })
        }
    }
}
