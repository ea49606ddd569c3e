//! Peer Verification Graph: two independent conditional appends per scan
//!
//! A scan of B's participant token by A writes edge A→B onto A's record and
//! edge B→A onto B's record. Each half is its own optimistic
//! read-append-write, retried on conflict, and skipped if the edge already
//! exists. There is no cross-record transaction: the duplicate-edge check is
//! what makes a repeated or half-completed scan safe to run again.

use super::notify::{ChangeEvent, ChangeKind};
use super::{short, AttendanceService};
use crate::attendance::{AttendanceRecord, EdgeInsert, PeerVerification};
use crate::error::AttendanceError;
use crate::storage::with_retry;
use crate::token::{Token, TokenExpectation, TokenKind};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerScanRequest {
    pub session_id: String,
    pub scanner_id: String,
    pub scanner_name: String,
    pub peer_id: String,
    pub peer_name: String,
    /// The participant token displayed by the peer
    pub token: Token,
}

/// Which halves of the pairing this call wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOutcome {
    pub scanner_updated: bool,
    pub peer_updated: bool,
}

impl PeerOutcome {
    /// Both edges were already present; nothing changed
    pub fn already_verified(&self) -> bool {
        !self.scanner_updated && !self.peer_updated
    }

    /// Treat a pure no-op as `AlreadyVerified`, for callers that want to
    /// tell the user the pairing was already recorded
    pub fn require_new(self, req: &PeerScanRequest) -> Result<Self, AttendanceError> {
        if self.already_verified() {
            return Err(AttendanceError::AlreadyVerified {
                scanner_id: req.scanner_id.clone(),
                peer_id: req.peer_id.clone(),
            });
        }
        Ok(self)
    }
}

impl AttendanceService {
    pub fn verify_peer(&self, req: &PeerScanRequest) -> Result<PeerOutcome, AttendanceError> {
        AttendanceError::required("session_id", &req.session_id)?;
        AttendanceError::required("scanner_id", &req.scanner_id)?;
        AttendanceError::required("peer_id", &req.peer_id)?;
        if req.scanner_id == req.peer_id {
            return Err(AttendanceError::SelfScanRejected);
        }
        self.rate_check(format!("scan:{}", req.scanner_id))?;

        let session = self.load_active_session(&req.session_id)?;
        self.codec.verify_expecting(
            &req.token,
            &session.secret,
            &TokenExpectation {
                kind: TokenKind::Participant,
                session_id: &session.id,
                subject_id: Some(&req.peer_id),
            },
        )?;

        for student in [&req.scanner_id, &req.peer_id] {
            if self.store.get_record(&session.id, student)?.is_none() {
                return Err(AttendanceError::NotCheckedIn {
                    session_id: session.id.clone(),
                    student_id: student.clone(),
                });
            }
        }

        // Attempt both halves even if the first fails
        let forward = self.attach_edge(req, &req.scanner_id, &req.peer_id, &req.peer_name);
        let reverse = self.attach_edge(req, &req.peer_id, &req.scanner_id, &req.scanner_name);

        let outcome = PeerOutcome {
            scanner_updated: forward?,
            peer_updated: reverse?,
        };
        if !outcome.already_verified() {
            info!(
                "Peer verification {} <-> {} in session {} (scanner:{}, peer:{})",
                req.scanner_id,
                req.peer_id,
                short(&session.id),
                outcome.scanner_updated,
                outcome.peer_updated
            );
        }
        Ok(outcome)
    }

    /// One conditional append onto `owner_id`'s record. Ok(false) if the
    /// edge was already there.
    fn attach_edge(
        &self,
        req: &PeerScanRequest,
        owner_id: &str,
        other_id: &str,
        other_name: &str,
    ) -> Result<bool, AttendanceError> {
        let key = format!("{}/{}", req.session_id, owner_id);
        let updated: Option<AttendanceRecord> = with_retry(&self.retry, &key, || {
            let current = self
                .store
                .get_record(&req.session_id, owner_id)?
                .ok_or_else(|| AttendanceError::NotCheckedIn {
                    session_id: req.session_id.clone(),
                    student_id: owner_id.to_string(),
                })?;
            let mut record = current.value;
            let edge = PeerVerification {
                peer_id: other_id.to_string(),
                peer_name: other_name.to_string(),
                verified_at: self.clock.now(),
                nonce: req.token.nonce.clone(),
            };
            match record.add_edge(edge, &self.scoring) {
                EdgeInsert::Added => {}
                EdgeInsert::Duplicate => return Ok(None),
                EdgeInsert::SelfEdge => return Err(AttendanceError::SelfScanRejected),
            }
            self.store.update_record_while_active(record.clone(), current.version)?;
            Ok(Some(record))
        })
        .map_err(AttendanceError::closed_as_not_active)?;

        match updated {
            Some(record) => {
                self.hub.publish(ChangeEvent {
                    kind: ChangeKind::PeerVerified,
                    session_id: record.session_id.clone(),
                    student_id: Some(record.student_id.clone()),
                    trust_score: Some(record.trust_score()),
                    at: self.clock.now(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
