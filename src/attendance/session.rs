//! Session: a bounded window in which one authority accepts check-ins

use crate::token::generate_secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub class_id: String,
    /// The teacher who started the session
    pub authority_id: String,
    pub status: SessionStatus,
    /// Signing secret, fixed for the session's lifetime
    pub secret: String,
    pub token_refresh_interval_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        class_id: impl Into<String>,
        authority_id: impl Into<String>,
        token_refresh_interval_secs: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            class_id: class_id.into(),
            authority_id: authority_id.into(),
            status: SessionStatus::Active,
            secret: generate_secret(),
            token_refresh_interval_secs,
            started_at,
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Terminal transition; returns false if already ended
    pub fn end(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = SessionStatus::Ended;
        self.ended_at = Some(at);
        true
    }

    pub fn summary(&self) -> String {
        format!(
            "Session {} | class={} | authority={} | status={:?} | started={}{}",
            &self.id[..8.min(self.id.len())],
            self.class_id,
            self.authority_id,
            self.status,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.ended_at
                .map(|t| format!(" | ended={}", t.format("%H:%M:%S")))
                .unwrap_or_default(),
        )
    }
}
