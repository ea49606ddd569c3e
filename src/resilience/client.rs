//! Resilient client: authoritative path first, degraded path on outages
//!
//! Only `ErrorClass::Infrastructure` failures are absorbed: the operation is
//! queued and the caller gets a `Delivery::Degraded` marker. Every other
//! failure is returned as-is, so the server-side checks still decide.

use super::queue::{OfflineQueue, OperationKind, QueueError, QueuedOp};
use crate::attendance::{AttendanceRecord, BiometricResult, Session};
use crate::error::{AttendanceError, ErrorClass};
use crate::service::{short, AttendanceService, CheckInRequest, OverrideRequest, PeerOutcome, PeerScanRequest};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of a call that may have been deferred
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// Committed to the authoritative store
    Confirmed(T),
    /// Store unreachable; queued as `op_id` for replay
    Degraded { provisional: Option<T>, op_id: String },
}

impl<T> Delivery<T> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Delivery::Confirmed(_))
    }

    pub fn is_degraded(&self) -> bool {
        !self.is_confirmed()
    }

    /// The confirmed value, or the provisional one if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Delivery::Confirmed(v) => Some(v),
            Delivery::Degraded { provisional, .. } => provisional.as_ref(),
        }
    }

    pub fn op_id(&self) -> Option<&str> {
        match self {
            Delivery::Confirmed(_) => None,
            Delivery::Degraded { op_id, .. } => Some(op_id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The service rejected the call; never queued
    #[error(transparent)]
    Rejected(#[from] AttendanceError),

    /// The store was down and the operation could not be queued either
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of one pass over the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Re-applies one queued operation against the service
pub type ReplayHandler = Box<dyn Fn(&AttendanceService, &QueuedOp) -> Result<(), AttendanceError> + Send + Sync>;

pub struct ResilientClient {
    service: Arc<AttendanceService>,
    queue: OfflineQueue,
    /// (session, student) → provisional record and the op that will confirm it
    provisional: Mutex<HashMap<(String, String), (AttendanceRecord, String)>>,
    handlers: HashMap<OperationKind, ReplayHandler>,
    replay_lock: Mutex<()>,
}

impl ResilientClient {
    /// Client with a replay handler registered for every operation kind
    pub fn new(service: Arc<AttendanceService>, queue: OfflineQueue) -> Self {
        let mut client = Self {
            service,
            queue,
            provisional: Mutex::new(HashMap::new()),
            handlers: HashMap::new(),
            replay_lock: Mutex::new(()),
        };
        client.register_handler(
            OperationKind::CheckIn,
            Box::new(|svc: &AttendanceService, op: &QueuedOp| match op {
                QueuedOp::CheckIn(req) => svc.check_in(req).map(|_| ()),
                _ => Err(mismatched(op)),
            }),
        );
        client.register_handler(
            OperationKind::VerifyPeer,
            Box::new(|svc: &AttendanceService, op: &QueuedOp| match op {
                QueuedOp::VerifyPeer(req) => svc.verify_peer(req).map(|_| ()),
                _ => Err(mismatched(op)),
            }),
        );
        client.register_handler(
            OperationKind::RecordBiometric,
            Box::new(|svc: &AttendanceService, op: &QueuedOp| match op {
                QueuedOp::RecordBiometric {
                    session_id,
                    student_id,
                    result,
                } => svc.record_biometric(session_id, student_id, result.clone()).map(|_| ()),
                _ => Err(mismatched(op)),
            }),
        );
        client.register_handler(
            OperationKind::SetOverride,
            Box::new(|svc: &AttendanceService, op: &QueuedOp| match op {
                QueuedOp::SetOverride(req) => svc.set_override(req).map(|_| ()),
                _ => Err(mismatched(op)),
            }),
        );
        client.register_handler(
            OperationKind::EndSession,
            Box::new(|svc: &AttendanceService, op: &QueuedOp| match op {
                QueuedOp::EndSession {
                    session_id,
                    requester_id,
                } => match svc.end_session(session_id, requester_id) {
                    // Someone else ended it while we were offline
                    Err(AttendanceError::SessionNotActive(_)) => Ok(()),
                    other => other.map(|_| ()),
                },
                _ => Err(mismatched(op)),
            }),
        );
        client
    }

    /// Replace the handler for one kind of operation
    pub fn register_handler(&mut self, kind: OperationKind, handler: ReplayHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn service(&self) -> &Arc<AttendanceService> {
        &self.service
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Locally created record for a check-in still awaiting replay
    pub fn provisional_record(&self, session_id: &str, student_id: &str) -> Option<AttendanceRecord> {
        self.lock_provisional()
            .get(&(session_id.to_string(), student_id.to_string()))
            .map(|(record, _)| record.clone())
    }

    pub fn check_in(&self, req: &CheckInRequest) -> Result<Delivery<AttendanceRecord>, ClientError> {
        match self.service.check_in(req) {
            Ok(record) => Ok(Delivery::Confirmed(record)),
            Err(err) => {
                self.absorb(err)?;
                let key = (req.session_id.clone(), req.student_id.clone());
                let mut provisional = self.lock_provisional();
                // A repeated offline check-in reuses the pending one
                if let Some((record, op_id)) = provisional.get(&key) {
                    return Ok(Delivery::Degraded {
                        provisional: Some(record.clone()),
                        op_id: op_id.clone(),
                    });
                }
                let now = self.service_now();
                let op_id = self.queue.enqueue(QueuedOp::CheckIn(req.clone()), now)?;
                let record = AttendanceRecord::provisional(&req.session_id, &req.student_id, &req.student_name, now);
                provisional.insert(key, (record.clone(), op_id.clone()));
                Ok(Delivery::Degraded {
                    provisional: Some(record),
                    op_id,
                })
            }
        }
    }

    pub fn verify_peer(&self, req: &PeerScanRequest) -> Result<Delivery<PeerOutcome>, ClientError> {
        match self.service.verify_peer(req) {
            Ok(outcome) => Ok(Delivery::Confirmed(outcome)),
            Err(err) => self.defer(err, QueuedOp::VerifyPeer(req.clone())),
        }
    }

    pub fn record_biometric(
        &self,
        session_id: &str,
        student_id: &str,
        result: BiometricResult,
    ) -> Result<Delivery<AttendanceRecord>, ClientError> {
        match self.service.record_biometric(session_id, student_id, result.clone()) {
            Ok(record) => Ok(Delivery::Confirmed(record)),
            Err(err) => self.defer(
                err,
                QueuedOp::RecordBiometric {
                    session_id: session_id.to_string(),
                    student_id: student_id.to_string(),
                    result,
                },
            ),
        }
    }

    pub fn set_override(&self, req: &OverrideRequest) -> Result<Delivery<AttendanceRecord>, ClientError> {
        match self.service.set_override(req) {
            Ok(record) => Ok(Delivery::Confirmed(record)),
            Err(err) => self.defer(err, QueuedOp::SetOverride(req.clone())),
        }
    }

    pub fn end_session(&self, session_id: &str, requester_id: &str) -> Result<Delivery<Session>, ClientError> {
        match self.service.end_session(session_id, requester_id) {
            Ok(session) => Ok(Delivery::Confirmed(session)),
            Err(err) => self.defer(
                err,
                QueuedOp::EndSession {
                    session_id: session_id.to_string(),
                    requester_id: requester_id.to_string(),
                },
            ),
        }
    }

    /// Drain the queue in enqueue order. Successful entries are removed;
    /// a business failure stays queued and the pass continues; an
    /// infrastructure failure ends the pass since the rest would fail too.
    pub fn replay(&self) -> Result<ReplayReport, QueueError> {
        let _serial = self.replay_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = ReplayReport::default();

        for entry in self.queue.pending() {
            let kind = entry.op.kind();
            let Some(handler) = self.handlers.get(&kind) else {
                warn!("No replay handler for {:?}; leaving {} queued", kind, short(&entry.id));
                report.failed += 1;
                continue;
            };
            match handler(&self.service, &entry.op) {
                Ok(()) => {
                    self.queue.remove(&entry.id)?;
                    self.forget_provisional(&entry.id);
                    report.replayed += 1;
                }
                Err(err) if err.is_infrastructure() => {
                    warn!("Replay of {} stopped, store still unavailable: {}", short(&entry.id), err);
                    report.failed += 1;
                    break;
                }
                Err(err) => {
                    warn!("Replay of {:?} {} rejected: {}", kind, short(&entry.id), err);
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.queue.len();
        if report.replayed > 0 || report.failed > 0 {
            info!(
                "Replay pass: {} replayed, {} failed, {} remaining",
                report.replayed, report.failed, report.remaining
            );
        }
        Ok(report)
    }

    /// Drop a queued operation the caller has given up on
    pub fn discard(&self, op_id: &str) -> Result<(), QueueError> {
        self.queue.discard(op_id)?;
        self.forget_provisional(op_id);
        Ok(())
    }

    /// Pass business errors through; Ok(()) means the caller should degrade
    fn absorb(&self, err: AttendanceError) -> Result<(), AttendanceError> {
        match err.class() {
            ErrorClass::Infrastructure => {
                warn!("Store unavailable, falling back to offline queue: {}", err);
                Ok(())
            }
            ErrorClass::Validation | ErrorClass::Protocol | ErrorClass::Conflict | ErrorClass::Concurrency => Err(err),
        }
    }

    fn defer<T>(&self, err: AttendanceError, op: QueuedOp) -> Result<Delivery<T>, ClientError> {
        self.absorb(err)?;
        let op_id = self.queue.enqueue(op, self.service_now())?;
        Ok(Delivery::Degraded {
            provisional: None,
            op_id,
        })
    }

    fn forget_provisional(&self, op_id: &str) {
        self.lock_provisional().retain(|_, (_, id)| id != op_id);
    }

    fn service_now(&self) -> DateTime<Utc> {
        self.service.now()
    }

    fn lock_provisional(&self) -> MutexGuard<'_, HashMap<(String, String), (AttendanceRecord, String)>> {
        self.provisional.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn mismatched(op: &QueuedOp) -> AttendanceError {
    AttendanceError::Validation {
        field: "op",
        reason: format!("handler does not accept {:?}", op.kind()),
    }
}
