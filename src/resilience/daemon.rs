//! Replay daemon
//!
//! Runs a background loop that:
//! 1. Probes the store and drains the offline queue once it answers
//! 2. Periodically reconciles trust scores of every active session
//!
//! The service is synchronous, so each pass runs on the blocking pool.

use super::client::{ReplayReport, ResilientClient};
use crate::config::ProtocolConfig;
use crate::service::short;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Timing for the replay daemon
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How often to probe the store and replay (seconds)
    pub replay_interval_secs: u64,
    /// How often to run recompute_all on active sessions (seconds)
    pub reconcile_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            replay_interval_secs: 5,
            reconcile_interval_secs: 60,
        }
    }
}

impl From<&ProtocolConfig> for DaemonConfig {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            replay_interval_secs: config.replay_interval_secs,
            reconcile_interval_secs: config.reconcile_interval_secs,
        }
    }
}

pub struct ReplayDaemon {
    pub config: DaemonConfig,
    client: Arc<ResilientClient>,
}

impl ReplayDaemon {
    pub fn new(config: DaemonConfig, client: Arc<ResilientClient>) -> Self {
        Self { config, client }
    }

    /// Loop until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut replay = time::interval(Duration::from_secs(self.config.replay_interval_secs.max(1)));
        let mut reconcile = time::interval(Duration::from_secs(self.config.reconcile_interval_secs.max(1)));
        replay.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Replay daemon started (replay every {}s, reconcile every {}s)",
            self.config.replay_interval_secs, self.config.reconcile_interval_secs
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = replay.tick() => {
                    self.replay_once().await;
                }
                _ = reconcile.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
        info!("Replay daemon stopped");
    }

    /// One probe-and-drain pass. None when the store is still unreachable
    /// or the queue is empty.
    pub async fn replay_once(&self) -> Option<ReplayReport> {
        if self.client.queue().is_empty() {
            return None;
        }
        let client = self.client.clone();
        let joined = tokio::task::spawn_blocking(move || {
            if let Err(e) = client.service().health() {
                debug!("Store still unreachable: {}", e);
                return None;
            }
            match client.replay() {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Replay pass aborted: {}", e);
                    None
                }
            }
        })
        .await;
        joined.unwrap_or_else(|e| {
            warn!("Replay task panicked: {}", e);
            None
        })
    }

    /// Recompute every active session; returns how many records changed
    pub async fn reconcile_once(&self) -> usize {
        let client = self.client.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let service = client.service();
            let sessions = match service.active_sessions() {
                Ok(sessions) => sessions,
                Err(e) => {
                    debug!("Skipping reconcile: {}", e);
                    return 0;
                }
            };
            let mut changed = 0;
            for session in sessions {
                match service.recompute_all(&session.id) {
                    Ok(n) => changed += n,
                    Err(e) => warn!("Reconcile of session {} failed: {}", short(&session.id), e),
                }
            }
            changed
        })
        .await;
        joined.unwrap_or_else(|e| {
            warn!("Reconcile task panicked: {}", e);
            0
        })
    }
}
