use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read resolver config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid resolver config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Entries kept in the in-memory value cache (default: 4096).
    pub cache_capacity: usize,
    /// Collection window opened by the first pending request (default: 25ms).
    pub collection_window_ms: u64,
    /// Distinct keys per collaborator call before a group is chunked (default: 100).
    pub max_batch_size: usize,
    /// Largest gap, in periods, between adjacent requested periods that still
    /// counts as one grid (default: 2).
    pub max_period_gap: u32,
    /// Interval between polls of a manifest entry (default: 250ms).
    pub manifest_poll_interval_ms: u64,
    /// Age after which a requested or running preload is presumed abandoned
    /// and may be failed and reclaimed (default: 600000ms).
    pub preload_stale_after_ms: u64,
    /// Waits on an in-progress preload before falling through (default: 3).
    pub retry_max_attempts: u32,
    /// Deadline of each wait (default: 2000ms).
    pub retry_attempt_wait_ms: u64,
    /// Pause between waits (default: 500ms).
    pub retry_backoff_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            collection_window_ms: 25,
            max_batch_size: 100,
            max_period_gap: 2,
            manifest_poll_interval_ms: 250,
            preload_stale_after_ms: 600_000,
            retry_max_attempts: 3,
            retry_attempt_wait_ms: 2_000,
            retry_backoff_ms: 500,
        }
    }
}

impl ResolverConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ResolverConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Clamp values that would disable a component outright.
    pub fn sanitized(mut self) -> Self {
        self.cache_capacity = self.cache_capacity.max(1);
        self.max_batch_size = self.max_batch_size.max(1);
        self.manifest_poll_interval_ms = self.manifest_poll_interval_ms.max(1);
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        self
    }

    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub fn manifest_poll_interval(&self) -> Duration {
        Duration::from_millis(self.manifest_poll_interval_ms)
    }

    pub fn preload_stale_after(&self) -> Duration {
        Duration::from_millis(self.preload_stale_after_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            attempt_wait: Duration::from_millis(self.retry_attempt_wait_ms),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = ResolverConfig::from_json_str(r#"{"max_period_gap": 3, "max_batch_size": 0}"#)
            .expect("parse config");
        assert_eq!(config.max_period_gap, 3);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.cache_capacity, ResolverConfig::default().cache_capacity);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = ResolverConfig::from_json_str(r#"{"max_period_gap": "wide"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("resolver.json");
        std::fs::write(&path, r#"{"collection_window_ms": 5}"#).expect("write config");
        let config = ResolverConfig::from_path(&path).expect("load config");
        assert_eq!(config.collection_window(), Duration::from_millis(5));
    }
}
