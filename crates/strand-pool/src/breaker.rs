//! Per-capability circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then open for a
//! cool-down. Once the cool-down elapses a single half-open probe is admitted:
//! success closes the breaker, failure reopens it with the cool-down doubled
//! up to `max_cooldown_ms`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use strand_core::config::BreakerConfig;
use strand_core::types::CircuitState;

/// Why a caller was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal operation.
    Closed,
    /// The single recovery probe after a cool-down.
    Probe,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// The cool-down that applies the next time the breaker is open.
    pub fn current_cooldown(&self) -> Duration {
        self.inner.lock().cooldown
    }

    /// Time left before a probe is admitted, if the breaker is open.
    /// A half-open breaker with a probe in flight reports zero.
    pub fn open_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => Some(Duration::ZERO),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= inner.cooldown {
                    None
                } else {
                    Some(inner.cooldown - elapsed)
                }
            }
        }
    }

    /// Ask to proceed. `Err` carries the time left until a probe may run.
    pub fn admit(&self) -> Result<Admission, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    info!(capability = %self.name, "Circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(inner.cooldown - elapsed)
                }
            }
        }
    }

    /// Record a success. Returns the new state if it changed.
    pub fn record_success(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::Closed {
            return None;
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.cooldown = Duration::from_millis(self.config.cooldown_ms);
        info!(capability = %self.name, "Circuit closed");
        Some(CircuitState::Closed)
    }

    /// Record a permanent (or retry-exhausted) failure. Returns the new state
    /// if it changed.
    pub fn record_failure(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => {
                let doubled = inner.cooldown.saturating_mul(2);
                inner.cooldown = doubled.min(Duration::from_millis(self.config.max_cooldown_ms));
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    capability = %self.name,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "Circuit probe failed, reopening"
                );
                Some(CircuitState::Open)
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    capability = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Give back an admitted probe that never reached an outcome (e.g. the
    /// caller was cancelled), so the next caller may probe instead.
    pub fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "search",
            BreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 100,
                max_cooldown_ms: 300,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        assert_eq!(b.admit(), Ok(Admission::Closed));
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), Some(CircuitState::Open));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.admit().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.record_success(), None);
        assert_eq!(b.consecutive_failures(), 0);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        let remaining = b.admit().unwrap_err();
        assert!(remaining <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        // Only one probe at a time
        assert_eq!(b.admit(), Err(Duration::ZERO));

        assert_eq!(b.record_success(), Some(CircuitState::Closed));
        assert_eq!(b.admit(), Ok(Admission::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_cooldown_up_to_ceiling() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        assert_eq!(b.record_failure(), Some(CircuitState::Open));
        assert_eq!(b.current_cooldown(), Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(b.admit().is_err());
        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        b.record_failure();
        assert_eq!(b.current_cooldown(), Duration::from_millis(300));

        tokio::time::advance(Duration::from_millis(301)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        b.record_failure();
        assert_eq!(b.current_cooldown(), Duration::from_millis(300));

        tokio::time::advance(Duration::from_millis(301)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        b.record_success();
        assert_eq!(b.current_cooldown(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_can_be_retaken() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(b.admit(), Ok(Admission::Probe));
        b.abandon_probe();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.admit(), Ok(Admission::Probe));
    }
}
