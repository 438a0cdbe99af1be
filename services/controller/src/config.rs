//! Configuration for the controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use raycon_reconcile::RetryPolicy;

use crate::controller::{ReconcilerConfig, WorkerConfig};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Concurrent reconciliation workers.
    pub workers: usize,

    /// Full resync interval in seconds.
    pub resync_secs: u64,

    /// Per store call deadline in milliseconds.
    pub call_timeout_ms: u64,

    /// Attempts per pass on conflicts and transient errors.
    pub conflict_retries: u32,

    /// Failed passes tolerated before a cluster is marked failed.
    pub failure_threshold: u32,

    pub failure_window_secs: u64,

    /// JSON file of clusters to load into the store at startup.
    pub manifest: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_or = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        let log_level = lookup("RAYCON_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let workers = parse_or("RAYCON_WORKERS", 4) as usize;
        let resync_secs = parse_or("RAYCON_RESYNC_SECS", 30);
        let call_timeout_ms = parse_or("RAYCON_CALL_TIMEOUT_MS", 5000);
        let conflict_retries = parse_or("RAYCON_CONFLICT_RETRIES", 5) as u32;
        let failure_threshold = parse_or("RAYCON_FAILURE_THRESHOLD", 3) as u32;
        let failure_window_secs = parse_or("RAYCON_FAILURE_WINDOW_SECS", 600);
        let manifest = lookup("RAYCON_MANIFEST")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if workers == 0 {
            bail!("RAYCON_WORKERS must be at least 1");
        }
        if resync_secs == 0 || call_timeout_ms == 0 {
            bail!("RAYCON_RESYNC_SECS and RAYCON_CALL_TIMEOUT_MS must be positive");
        }

        Ok(Self {
            log_level,
            workers,
            resync_secs,
            call_timeout_ms,
            conflict_retries,
            failure_threshold,
            failure_window_secs,
            manifest,
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            conflict_retry: RetryPolicy::with_max_attempts(self.conflict_retries.max(1)),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_secs),
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_secs, 30);
        assert_eq!(config.call_timeout_ms, 5000);
        assert_eq!(config.conflict_retries, 5);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failure_window_secs, 600);
        assert!(config.manifest.is_none());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = load(&[
            ("RAYCON_WORKERS", "8"),
            ("RAYCON_RESYNC_SECS", "not-a-number"),
            ("RAYCON_MANIFEST", "/etc/raycon/clusters.json"),
        ])
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_secs, 30);
        assert_eq!(
            config.manifest,
            Some(PathBuf::from("/etc/raycon/clusters.json"))
        );
        assert_eq!(config.worker().workers, 8);
        assert_eq!(config.reconciler().call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(load(&[("RAYCON_WORKERS", "0")]).is_err());
    }
}
