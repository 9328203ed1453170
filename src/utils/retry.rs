//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Schedules come from
//! `BackoffConfig`; see `BackoffConfig::publish` and `BackoffConfig::reconnect`
//! for the defaults.

use backon::ExponentialBuilder;

use crate::config::BackoffConfig;
use crate::transport::TransportError;

/// Build a backoff schedule from configuration.
///
/// `max_attempts` counts the first try, so the schedule yields one delay
/// fewer than the attempt budget.
pub fn backoff(config: &BackoffConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay());

    let builder = match config.max_attempts {
        Some(attempts) => builder.with_max_times(attempts.saturating_sub(1)),
        None => builder.without_max_times(),
    };

    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Determines if a transport error is worth retrying.
///
/// Retryable:
/// - `Transient`: timeouts, throttling
/// - `ConnectionLost`: the connection may come back
///
/// Everything else (rejections, conflicts, lost leases) fails the same way
/// on every attempt.
pub fn is_retryable(err: &TransportError) -> bool {
    err.is_transient()
}
