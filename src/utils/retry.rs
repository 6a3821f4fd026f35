//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Backoff for reconciles that failed with a transient error.
///
/// - Min delay: 500ms
/// - Max delay: 5m
/// - Jitter enabled
pub fn reconcile_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(300))
        .with_max_times(64)
        .with_jitter()
}

/// Backoff while waiting for a file written by a sidecar.
///
/// - Min delay: 250ms
/// - Max delay: 5s
/// - Max attempts: 60
/// - Jitter enabled
pub fn file_wait_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(60)
        .with_jitter()
}

/// Backoff for the apply job reaching its database.
///
/// - Min delay: 1s
/// - Max delay: 30s
/// - Max attempts: 8
/// - Jitter enabled
pub fn connect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(8)
        .with_jitter()
}

/// Delay before retry number `attempt` (0-based), capped at `max`.
pub fn nth_delay(builder: ExponentialBuilder, attempt: usize, max: Duration) -> Duration {
    builder.build().nth(attempt).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nth_delay_is_capped() {
        let max = Duration::from_secs(300);
        let first = nth_delay(reconcile_backoff(), 0, max);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= max);
        assert_eq!(nth_delay(reconcile_backoff(), 10_000, max), max);
    }

    #[test]
    fn test_nth_delay_grows() {
        let builder = || {
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(10))
                .with_max_times(10)
        };
        let max = Duration::from_secs(10);
        assert_eq!(nth_delay(builder(), 0, max), Duration::from_millis(100));
        assert_eq!(nth_delay(builder(), 2, max), Duration::from_millis(400));
    }
}
