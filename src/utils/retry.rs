//! Retry utilities: backoff builders and the outbox retry schedule.
//!
//! Uses `backon` for exponential backoff with jitter where the caller itself
//! retries. Outbox retries are different: the delay is persisted in
//! `available_at`, so [`outbox_retry_delay`] is a pure function of the
//! attempt count.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for retrying a submission while the store is unavailable.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 5
/// - Jitter enabled
pub fn submit_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for a dispatcher loop whose store is unavailable.
///
/// Unbounded: a dispatcher keeps trying until stopped.
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn store_outage_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff for store connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Delay before an event released after its `attempts`-th claim may be
/// claimed again: `min(max, initial * 2^(attempts-1))`.
pub fn outbox_retry_delay(attempts: i32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
    initial
        .checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}
