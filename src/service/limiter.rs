//! Rate limiting, injected into the service rather than held globally

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait RateLimiter: Send + Sync {
    /// Count one request against `key`; false if it is over the limit
    fn check(&self, key: &str) -> bool;
}

/// Never limits
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _key: &str) -> bool {
        true
    }
}

/// Per-key counters over fixed time windows
pub struct FixedWindowLimiter {
    limit: u32,
    window_ms: i64,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window_ms: (window_secs as i64).max(1) * 1000,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let window_start = now - now.rem_euclid(self.window_ms);
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Forget keys whose window has passed
        if windows.len() > 10_000 {
            windows.retain(|_, (start, _)| *start == window_start);
        }

        let entry = windows.entry(key.to_string()).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_window_resets() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = FixedWindowLimiter::new(2, 60, clock.clone());
        assert!(limiter.check("scan:alice"));
        assert!(limiter.check("scan:alice"));
        assert!(!limiter.check("scan:alice"));
        assert!(limiter.check("scan:bob"));

        clock.advance_secs(60);
        assert!(limiter.check("scan:alice"));
    }

    #[test]
    fn test_unlimited() {
        assert!((0..1000).all(|_| Unlimited.check("k")));
    }
}
