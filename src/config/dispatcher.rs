//! Dispatcher configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Claim dispatcher tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of dispatcher tasks started by the binary.
    pub workers: usize,
    /// Worker identities are `{prefix}-{index}-{uuid}`.
    pub worker_id_prefix: String,
    /// Maximum candidates examined per iteration.
    pub batch_size: u32,
    /// Idle sleep between iterations when the batch was not full.
    pub poll_interval_ms: u64,
    /// How long a claim stays exclusive.
    pub lease_secs: u64,
    /// Claims allowed per event before it is dead-lettered.
    pub max_attempts: i32,
    /// Delay before the first retry after a failed publish. Zero retries immediately.
    pub retry_backoff_initial_ms: u64,
    /// Upper bound on the retry delay.
    pub retry_backoff_max_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            worker_id_prefix: "courier".to_string(),
            batch_size: 100,
            poll_interval_ms: 1000,
            lease_secs: 30,
            max_attempts: 5,
            retry_backoff_initial_ms: 1000,
            retry_backoff_max_ms: 300_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn retry_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_initial_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}
