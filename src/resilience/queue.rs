//! Offline queue: durable buffer of operations awaiting replay
//!
//! Entries keep enqueue order and are removed only after their replay
//! handler succeeds. With a path, every change rewrites the JSON file so a
//! restarted client resumes where it left off.

use crate::attendance::BiometricResult;
use crate::service::{short, CheckInRequest, OverrideRequest, PeerScanRequest};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CheckIn,
    VerifyPeer,
    RecordBiometric,
    SetOverride,
    EndSession,
}

/// A mutating call captured for later replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum QueuedOp {
    CheckIn(CheckInRequest),
    VerifyPeer(PeerScanRequest),
    RecordBiometric {
        session_id: String,
        student_id: String,
        result: BiometricResult,
    },
    SetOverride(OverrideRequest),
    EndSession {
        session_id: String,
        requester_id: String,
    },
}

impl QueuedOp {
    pub fn kind(&self) -> OperationKind {
        match self {
            QueuedOp::CheckIn(_) => OperationKind::CheckIn,
            QueuedOp::VerifyPeer(_) => OperationKind::VerifyPeer,
            QueuedOp::RecordBiometric { .. } => OperationKind::RecordBiometric,
            QueuedOp::SetOverride(_) => OperationKind::SetOverride,
            QueuedOp::EndSession { .. } => OperationKind::EndSession,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub op: QueuedOp,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No queued operation {0}")]
    NotFound(String),
}

pub struct OfflineQueue {
    path: Option<PathBuf>,
    entries: Mutex<VecDeque<QueuedOperation>>,
}

impl OfflineQueue {
    /// Queue that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Load the queue file at `path`, or start empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let entries: VecDeque<QueuedOperation> = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            VecDeque::new()
        };
        if !entries.is_empty() {
            info!("Loaded {} pending operation(s) from {}", entries.len(), path.display());
        }
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an operation; returns its id
    pub fn enqueue(&self, op: QueuedOp, at: DateTime<Utc>) -> Result<String, QueueError> {
        let entry = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            op,
            enqueued_at: at,
        };
        let id = entry.id.clone();
        let mut entries = self.lock();
        debug!("Queued {:?} operation {}", entry.op.kind(), short(&id));
        entries.push_back(entry);
        if let Err(e) = self.save(&entries) {
            entries.pop_back();
            return Err(e);
        }
        Ok(id)
    }

    /// Pending operations in enqueue order
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<QueuedOperation> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Drop an entry after a successful replay. Ok(false) if it was already gone.
    pub fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return Ok(false);
        };
        let removed = entries.remove(pos);
        if let Err(e) = self.save(&entries) {
            if let Some(entry) = removed {
                entries.insert(pos, entry);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Give up on an operation the caller will not retry
    pub fn discard(&self, id: &str) -> Result<QueuedOperation, QueueError> {
        let entry = self.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.remove(id)?;
        info!("Discarded queued {:?} operation {}", entry.op.kind(), short(id));
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedOperation>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, entries: &VecDeque<QueuedOperation>) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
