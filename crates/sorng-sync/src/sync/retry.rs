//! Retry ceilings and backoff delays.

use crate::sync::queue::TaskOrigin;
use rand::Rng;
use sorng_core::config::EngineConfig;
use sorng_core::error::SyncError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Ceiling for watcher and reconciliation tasks.
    pub realtime_max: u32,
    /// Ceiling for manual and bulk transfers.
    pub manual_max: u32,
}

impl RetryPolicy {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            realtime_max: config.realtime_max_retries,
            manual_max: config.manual_max_retries,
        }
    }

    pub fn max_retries(&self, origin: TaskOrigin) -> u32 {
        match origin {
            TaskOrigin::Watcher | TaskOrigin::Reconcile => self.realtime_max,
            TaskOrigin::Manual | TaskOrigin::Bulk => self.manual_max,
        }
    }

    /// Whether a task that failed on its `attempt`-th try (1-based) runs again.
    pub fn should_retry(&self, error: &SyncError, origin: TaskOrigin, attempt: u32) -> bool {
        error.is_transient() && attempt <= self.max_retries(origin)
    }

    /// `base × attempt` plus up to one `base` of random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..base)
        } else {
            0
        };
        Duration::from_millis(base.saturating_mul(attempt.max(1) as u64) + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}
