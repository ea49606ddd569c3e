//! Bounded retry on write conflicts

use crate::config::ProtocolConfig;
use crate::error::AttendanceError;
use log::{debug, warn};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl From<&ProtocolConfig> for RetryPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_attempts: config.max_write_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Run a read-modify-write closure, re-running it from scratch on a
/// version conflict. Backoff grows linearly with the attempt number.
/// Any other error is returned immediately.
pub fn with_retry<T, F>(policy: &RetryPolicy, key: &str, mut op: F) -> Result<T, AttendanceError>
where
    F: FnMut() -> Result<T, AttendanceError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Err(e) if e.is_write_conflict() => {
                if attempt >= policy.max_attempts {
                    warn!("Write conflict on {} not resolved after {} attempts", key, attempt);
                    return Err(AttendanceError::ConcurrencyExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                    });
                }
                debug!("Write conflict on {} (attempt {}), retrying", key, attempt);
                if !policy.backoff.is_zero() {
                    std::thread::sleep(policy.backoff * attempt);
                }
            }
            other => return other,
        }
    }
}
