use std::time::Duration;

use tokio_util::sync::CancellationToken;

use strand_core::config::RetryConfig;
use strand_core::error::ErrorKind;

/// Bookkeeping for one scheduled retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    /// Delay before the next attempt.
    pub delay: Duration,
    pub cause: ErrorKind,
}

/// Exponential backoff with jitter, bounded by a maximum attempt count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_backoff_ms);
        if !self.config.jitter {
            return Duration::from_millis(ms);
        }
        // Jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }

    /// Decide whether to retry after attempt `attempt` failed with `cause`.
    ///
    /// Only transient failures are retried, and never past `max_attempts`.
    pub fn next(&self, attempt: u32, cause: ErrorKind) -> Option<RetryState> {
        if cause != ErrorKind::Transient || attempt >= self.config.max_attempts {
            return None;
        }
        Some(RetryState {
            attempt,
            delay: self.backoff(attempt),
            cause,
        })
    }
}

/// Sleep for `delay`, returning `false` if `cancel` fired first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(false);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(5), Duration::from_millis(1000));
        assert_eq!(p.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let p = policy(true);
        for _ in 0..100 {
            let d = p.backoff(2).as_millis();
            assert!((160..=240).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_next_only_retries_transient() {
        let p = policy(false);
        let state = p.next(1, ErrorKind::Transient).unwrap();
        assert_eq!(state.attempt, 1);
        assert_eq!(state.delay, Duration::from_millis(100));

        assert!(p.next(1, ErrorKind::Permanent).is_none());
        assert!(p.next(1, ErrorKind::Fatal).is_none());
    }

    #[test]
    fn test_next_stops_at_max_attempts() {
        let p = policy(false);
        assert!(p.next(3, ErrorKind::Transient).is_some());
        assert!(p.next(4, ErrorKind::Transient).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(10), &cancel).await);

        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
    }
}
