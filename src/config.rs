//! Protocol configuration
//!
//! All thresholds and timings of the attendance protocol in one place.
//! Loaded from JSON; absent fields fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for tokens, scoring, fraud analysis, retries and replay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Maximum token age before it is rejected (milliseconds)
    pub token_ttl_ms: i64,
    /// How often clients should re-mint displayed tokens (seconds)
    pub token_refresh_interval_secs: u64,
    /// Peer edges required for a `present` classification
    pub peer_threshold: usize,
    /// Minimum matcher confidence for a biometric pass
    pub biometric_min_confidence: f64,
    /// Fraction of sessions a pair must co-verify in to be flagged
    pub fraud_pair_ratio: f64,
    /// Sessions required before any fraud pattern is emitted
    pub fraud_min_sessions: usize,
    /// Distinct peers at or below which a student is flagged
    pub low_peer_max_distinct: usize,
    /// Attempts for a conditional write before giving up
    pub max_write_attempts: u32,
    /// Base backoff between conflicting write attempts (milliseconds)
    pub retry_backoff_ms: u64,
    /// Requests allowed per key in one rate window
    pub rate_limit_per_window: u32,
    /// Rate window length (seconds)
    pub rate_limit_window_secs: u64,
    /// Interval of the background trust-score reconciliation (seconds)
    pub reconcile_interval_secs: u64,
    /// Interval between connectivity probes for queue replay (seconds)
    pub replay_interval_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: 60_000,
            token_refresh_interval_secs: 30,
            peer_threshold: 3,
            biometric_min_confidence: 0.70,
            fraud_pair_ratio: 0.8,
            fraud_min_sessions: 3,
            low_peer_max_distinct: 1,
            max_write_attempts: 3,
            retry_backoff_ms: 10,
            rate_limit_per_window: 30,
            rate_limit_window_secs: 60,
            reconcile_interval_secs: 60,
            replay_interval_secs: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ProtocolConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_ttl_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "token_ttl_ms",
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.biometric_min_confidence) {
            return Err(ConfigError::Invalid {
                field: "biometric_min_confidence",
                reason: format!("{} is outside [0, 1]", self.biometric_min_confidence),
            });
        }
        if self.fraud_pair_ratio <= 0.0 || self.fraud_pair_ratio > 1.0 {
            return Err(ConfigError::Invalid {
                field: "fraud_pair_ratio",
                reason: format!("{} is outside (0, 1]", self.fraud_pair_ratio),
            });
        }
        if self.max_write_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_write_attempts",
                reason: "at least one attempt is required".into(),
            });
        }
        if self.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit_window_secs",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token_ttl_ms, 60_000);
        assert_eq!(config.peer_threshold, 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = std::env::temp_dir().join(format!("rollcall-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"peer_threshold": 5}"#).unwrap();

        let config = ProtocolConfig::load(&path).unwrap();
        assert_eq!(config.peer_threshold, 5);
        assert_eq!(config.max_write_attempts, 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let config = ProtocolConfig {
            fraud_pair_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "fraud_pair_ratio", .. })
        ));
    }
}
