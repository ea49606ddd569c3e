//! Session Registry: one active session per class, active → ended
//!
//! Token issuance lives here too since only the registry knows secrets.

use super::notify::{ChangeEvent, ChangeKind};
use super::{short, AttendanceService};
use crate::attendance::Session;
use crate::error::AttendanceError;
use crate::storage::{with_retry, StoreError};
use crate::token::{Token, TokenKind};
use log::info;

impl AttendanceService {
    /// Open a session for a class. The store rejects a second active
    /// session for the same class atomically.
    pub fn start_session(&self, class_id: &str, authority_id: &str) -> Result<Session, AttendanceError> {
        AttendanceError::required("class_id", class_id)?;
        AttendanceError::required("authority_id", authority_id)?;

        let session = Session::new(
            class_id,
            authority_id,
            self.config.token_refresh_interval_secs,
            self.clock.now(),
        );
        let created = match self.store.create_session(session) {
            Ok(created) => created.value,
            Err(StoreError::AlreadyExists(_)) => {
                let session_id = self
                    .store
                    .active_session_for_class(class_id)?
                    .map(|s| s.id)
                    .unwrap_or_default();
                return Err(AttendanceError::AlreadyActive {
                    class_id: class_id.to_string(),
                    session_id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Session {} started for class {} by {}",
            short(&created.id),
            class_id,
            authority_id
        );
        self.hub.publish(ChangeEvent {
            kind: ChangeKind::SessionStarted,
            session_id: created.id.clone(),
            student_id: None,
            trust_score: None,
            at: created.started_at,
        });
        Ok(created)
    }

    /// End a session. Only its authority may do so; ending is terminal.
    pub fn end_session(&self, session_id: &str, requester_id: &str) -> Result<Session, AttendanceError> {
        let ended = with_retry(&self.retry, session_id, || {
            let current = self.load_session(session_id)?;
            let mut session = current.value;
            if session.authority_id != requester_id {
                return Err(AttendanceError::PermissionDenied(requester_id.to_string()));
            }
            if !session.end(self.clock.now()) {
                return Err(AttendanceError::SessionNotActive(session_id.to_string()));
            }
            self.store.update_session(session.clone(), current.version)?;
            Ok(session)
        })?;

        info!("Session {} ended by {}", short(session_id), requester_id);
        self.hub.publish(ChangeEvent {
            kind: ChangeKind::SessionEnded,
            session_id: ended.id.clone(),
            student_id: None,
            trust_score: None,
            at: ended.ended_at.unwrap_or_else(|| self.clock.now()),
        });
        Ok(ended)
    }

    pub fn active_session(&self, class_id: &str) -> Result<Option<Session>, AttendanceError> {
        Ok(self.store.active_session_for_class(class_id)?)
    }

    pub fn active_sessions(&self) -> Result<Vec<Session>, AttendanceError> {
        Ok(self.store.active_sessions()?)
    }

    /// Mint the check-in token the teacher displays
    pub fn issue_authority_token(&self, session_id: &str, requester_id: &str) -> Result<Token, AttendanceError> {
        let session = self.load_active_session(session_id)?;
        if session.authority_id != requester_id {
            return Err(AttendanceError::PermissionDenied(requester_id.to_string()));
        }
        Ok(self
            .codec
            .mint(TokenKind::Authority, &session.id, &session.authority_id, &session.secret)?)
    }

    /// Mint the token a checked-in student displays to peers
    pub fn issue_participant_token(&self, session_id: &str, student_id: &str) -> Result<Token, AttendanceError> {
        let session = self.load_active_session(session_id)?;
        if self.store.get_record(session_id, student_id)?.is_none() {
            return Err(AttendanceError::NotCheckedIn {
                session_id: session_id.to_string(),
                student_id: student_id.to_string(),
            });
        }
        Ok(self
            .codec
            .mint(TokenKind::Participant, &session.id, student_id, &session.secret)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::harness;
    use super::super::Topic;
    use super::*;
    use crate::attendance::SessionStatus;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_start_and_end() {
        let h = harness();
        let session = h.service.start_session("cs101", "prof").unwrap();
        assert!(session.is_active());
        assert_eq!(h.service.active_session("cs101").unwrap().unwrap().id, session.id);

        let ended = h.service.end_session(&session.id, "prof").unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert!(h.service.active_session("cs101").unwrap().is_none());

        // A new session may start once the old one ended
        assert!(h.service.start_session("cs101", "prof").is_ok());
    }

    #[test]
    fn test_second_active_session_rejected() {
        let h = harness();
        let first = h.service.start_session("cs101", "prof").unwrap();
        match h.service.start_session("cs101", "prof") {
            Err(AttendanceError::AlreadyActive { session_id, .. }) => assert_eq!(session_id, first.id),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_starts_yield_one_session() {
        let h = harness();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&h.service);
                thread::spawn(move || service.start_session("race", "prof"))
            })
            .collect();
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(ok, 1);
    }

    #[test]
    fn test_end_requires_authority() {
        let h = harness();
        let session = h.service.start_session("cs101", "prof").unwrap();
        assert!(matches!(
            h.service.end_session(&session.id, "student"),
            Err(AttendanceError::PermissionDenied(who)) if who == "student"
        ));
        h.service.end_session(&session.id, "prof").unwrap();
        assert!(matches!(
            h.service.end_session(&session.id, "prof"),
            Err(AttendanceError::SessionNotActive(_))
        ));
    }

    #[test]
    fn test_token_issuance() {
        let h = harness();
        let session = h.session_with("cs101", &["alice"]);
        let teacher_token = h.service.issue_authority_token(&session.id, "teacher").unwrap();
        assert_eq!(teacher_token.kind, TokenKind::Authority);
        assert!(matches!(
            h.service.issue_authority_token(&session.id, "alice"),
            Err(AttendanceError::PermissionDenied(_))
        ));

        let student_token = h.service.issue_participant_token(&session.id, "alice").unwrap();
        assert_eq!(student_token.subject_id, "alice");
        assert!(matches!(
            h.service.issue_participant_token(&session.id, "mallory"),
            Err(AttendanceError::NotCheckedIn { .. })
        ));
    }

    #[test]
    fn test_lifecycle_notifications() {
        let h = harness();
        let session = h.service.start_session("cs101", "prof").unwrap();
        let mut sub = h.service.subscribe(Topic::Session(session.id.clone()));
        h.service.end_session(&session.id, "prof").unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::SessionEnded);
    }
}
