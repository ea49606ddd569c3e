//! Check-in: unregistered → checked-in, exactly once per (session, student)
//!
//! Retries and offline replays call this repeatedly with the same
//! arguments; the store's first-write-wins insert guarantees they all see
//! the same record.

use super::notify::{ChangeEvent, ChangeKind};
use super::{short, AttendanceService};
use crate::attendance::AttendanceRecord;
use crate::error::AttendanceError;
use crate::token::{Token, TokenExpectation, TokenKind};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub session_id: String,
    pub student_id: String,
    pub student_name: String,
    /// The authority token scanned from the teacher's screen, if any
    pub token: Option<Token>,
}

impl AttendanceService {
    pub fn check_in(&self, req: &CheckInRequest) -> Result<AttendanceRecord, AttendanceError> {
        AttendanceError::required("session_id", &req.session_id)?;
        AttendanceError::required("student_id", &req.student_id)?;
        AttendanceError::required("student_name", &req.student_name)?;

        let session = self.load_active_session(&req.session_id)?;

        if let Some(token) = &req.token {
            self.codec.verify_expecting(
                token,
                &session.secret,
                &TokenExpectation {
                    kind: TokenKind::Authority,
                    session_id: &session.id,
                    subject_id: Some(&session.authority_id),
                },
            )?;
        }

        // Repeats of a completed check-in are answered before the rate limit
        if let Some(existing) = self.store.get_record(&session.id, &req.student_id)? {
            return Ok(self.fresh(existing.value));
        }
        self.rate_check(format!("checkin:{}", req.student_id))?;

        let record = AttendanceRecord::new(&session, &req.student_id, &req.student_name, self.clock.now());
        let inserted = self
            .store
            .insert_record_while_active(record)
            .map_err(|e| AttendanceError::from(e).closed_as_not_active())?;
        let stored = inserted.stored.value;

        if inserted.created {
            info!(
                "Checked in {} to session {} (record {})",
                req.student_id,
                short(&session.id),
                short(&stored.id)
            );
            self.hub.publish(ChangeEvent {
                kind: ChangeKind::CheckedIn,
                session_id: session.id.clone(),
                student_id: Some(stored.student_id.clone()),
                trust_score: Some(stored.trust_score()),
                at: stored.checked_in_at,
            });
        }
        Ok(stored)
    }
}
