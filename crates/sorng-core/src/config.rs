//! Engine tunables.
//!
//! Unlike [`ConnectionProfile`](crate::profile::ConnectionProfile), which is
//! per endpoint and owned by the user, these settings are process-wide
//! knobs. Every field has a serde default so a partial JSON file works.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// An idle connection released more recently than this is reused
    /// without a liveness probe.
    #[serde(default = "default_freshness_ms")]
    pub pool_freshness_ms: u64,
    /// How long `acquire` sleeps when the pool is at its bound.
    #[serde(default = "default_pool_wait_ms")]
    pub pool_wait_ms: u64,
    /// Upper bound of the random delay before opening a new connection.
    #[serde(default = "default_connect_jitter_ms")]
    pub connect_jitter_ms: u64,
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_data_timeout_sec")]
    pub data_timeout_sec: u64,
    /// A changed file must stay untouched this long before it is queued.
    #[serde(default = "default_stability_ms")]
    pub stability_window_ms: u64,
    /// Remote reconciliation interval for bi-directional sessions.
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry ceiling for watcher / reconciliation tasks.
    #[serde(default = "default_realtime_retries")]
    pub realtime_max_retries: u32,
    /// Retry ceiling for manual and bulk transfers.
    #[serde(default = "default_manual_retries")]
    pub manual_max_retries: u32,
    /// Minimum gap between two progress updates of one transfer.
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// Delay before batch totals reset after the queue drains.
    #[serde(default = "default_batch_grace_ms")]
    pub batch_reset_grace_ms: u64,
    /// Window during which a freshly downloaded file is not echoed back.
    #[serde(default = "default_echo_ms")]
    pub echo_suppression_ms: u64,
    /// Per-root ignore file that replaces the built-in baseline.
    #[serde(default = "default_ignore_file")]
    pub ignore_file_name: String,
    /// Number of outcome log entries kept in memory per session.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_freshness_ms() -> u64 {
    30_000
}
fn default_pool_wait_ms() -> u64 {
    200
}
fn default_connect_jitter_ms() -> u64 {
    250
}
fn default_connect_timeout_sec() -> u64 {
    15
}
fn default_data_timeout_sec() -> u64 {
    30
}
fn default_stability_ms() -> u64 {
    1_000
}
fn default_reconcile_interval_sec() -> u64 {
    60
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_realtime_retries() -> u32 {
    5
}
fn default_manual_retries() -> u32 {
    3
}
fn default_progress_throttle_ms() -> u64 {
    200
}
fn default_batch_grace_ms() -> u64 {
    1_500
}
fn default_echo_ms() -> u64 {
    5_000
}
fn default_ignore_file() -> String {
    ".syncignore".to_string()
}
fn default_log_capacity() -> usize {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_freshness_ms: default_freshness_ms(),
            pool_wait_ms: default_pool_wait_ms(),
            connect_jitter_ms: default_connect_jitter_ms(),
            connect_timeout_sec: default_connect_timeout_sec(),
            data_timeout_sec: default_data_timeout_sec(),
            stability_window_ms: default_stability_ms(),
            reconcile_interval_sec: default_reconcile_interval_sec(),
            retry_base_delay_ms: default_retry_base_ms(),
            realtime_max_retries: default_realtime_retries(),
            manual_max_retries: default_manual_retries(),
            progress_throttle_ms: default_progress_throttle_ms(),
            batch_reset_grace_ms: default_batch_grace_ms(),
            echo_suppression_ms: default_echo_ms(),
            ignore_file_name: default_ignore_file(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncError::invalid_config(format!("Invalid engine config: {}", e)))
    }

    /// Load from a JSON file, or return the defaults when it does not exist.
    pub fn load(path: &Path) -> SyncResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No engine config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SyncError::io_error(format!(
                "Cannot read engine config {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn pool_freshness(&self) -> Duration {
        Duration::from_millis(self.pool_freshness_ms)
    }
    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_ms)
    }
    pub fn connect_jitter(&self) -> Duration {
        Duration::from_millis(self.connect_jitter_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }
    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_sec.max(1))
    }
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
    pub fn batch_reset_grace(&self) -> Duration {
        Duration::from_millis(self.batch_reset_grace_ms)
    }
    pub fn echo_suppression(&self) -> Duration {
        Duration::from_millis(self.echo_suppression_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json(r#"{ "poolWaitMs": 50, "manualMaxRetries": 1 }"#).unwrap();
        assert_eq!(cfg.pool_wait(), Duration::from_millis(50));
        assert_eq!(cfg.manual_max_retries, 1);
        assert_eq!(cfg.realtime_max_retries, 5);
        assert_eq!(cfg.pool_freshness(), Duration::from_secs(30));
        assert_eq!(cfg.ignore_file_name, ".syncignore");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(&dir.path().join("engine.json")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn bad_json_is_invalid_config() {
        let err = EngineConfig::from_json("{ nope").unwrap_err();
        assert!(err.is_fatal());
    }
}
