use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use strand_core::config::CapabilityConfig;
use strand_core::error::{ConnectError, ErrorKind, Result, StrandError};
use strand_core::event::EventBus;
use strand_core::traits::{Connection, Connector};
use strand_core::types::{CircuitState, RunEvent};

use crate::breaker::{Admission, CircuitBreaker};
use crate::lease::Lease;
use crate::retry::{sleep_or_cancel, RetryPolicy};

/// A live connection plus its age bookkeeping.
#[derive(Clone)]
pub(crate) struct PooledConnection {
    pub conn: Arc<dyn Connection>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    born: Instant,
    ttl: Duration,
}

impl PooledConnection {
    fn new(conn: Arc<dyn Connection>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        // Saturates for TTLs past what chrono can represent.
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            conn,
            created_at,
            expires_at,
            born: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.born.elapsed() >= self.ttl
    }
}

/// Snapshot of one capability pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub idle: usize,
    pub established: u64,
    pub circuit: CircuitState,
}

/// Bounded pool of connections for one capability.
pub(crate) struct CapabilityPool {
    name: String,
    config: CapabilityConfig,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PooledConnection>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    established: AtomicU64,
    events: Arc<EventBus>,
}

impl CapabilityPool {
    pub fn new(
        name: impl Into<String>,
        config: CapabilityConfig,
        connector: Arc<dyn Connector>,
        events: Arc<EventBus>,
    ) -> Self {
        let name = name.into();
        Self {
            permits: Arc::new(Semaphore::new(config.pool_capacity)),
            idle: Mutex::new(Vec::new()),
            breaker: CircuitBreaker::new(name.clone(), config.breaker.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            established: AtomicU64::new(0),
            name,
            config,
            connector,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CapabilityConfig {
        &self.config
    }

    /// Wait for a free slot, then hand out a warm connection or establish one.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        // Fast-fail while the breaker is open and nothing warm could be reused
        if self.idle.lock().is_empty() {
            if let Some(remaining) = self.breaker.open_remaining() {
                return Err(StrandError::CircuitOpen {
                    capability: self.name.clone(),
                    retry_in_ms: remaining.as_millis() as u64,
                });
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StrandError::Cancelled),
            res = tokio::time::timeout(timeout, self.permits.clone().acquire_owned()) => match res {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(StrandError::PermanentConnection {
                        capability: self.name.clone(),
                        message: "pool closed".into(),
                    })
                }
                Err(_) => {
                    return Err(StrandError::LeaseTimeout {
                        capability: self.name.clone(),
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
            },
        };

        let pooled = match self.checkout_idle() {
            Some(pooled) => pooled,
            None => self.establish(cancel).await?,
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let lease = Lease::new(pooled, self.clone(), permit);
        debug!(capability = %self.name, lease_id = %lease.lease_id(), in_flight = now, "Lease acquired");
        self.events.publish(RunEvent::LeaseAcquired {
            capability: self.name.clone(),
            lease_id: lease.lease_id().to_string(),
        });
        Ok(lease)
    }

    /// Pop a reusable idle connection, closing expired or unhealthy ones.
    fn checkout_idle(&self) -> Option<PooledConnection> {
        let mut idle = self.idle.lock();
        while let Some(pooled) = idle.pop() {
            if pooled.is_expired() || !pooled.conn.is_healthy() {
                debug!(capability = %self.name, "Discarding stale connection");
                pooled.conn.close();
                continue;
            }
            return Some(pooled);
        }
        None
    }

    /// Open a new connection through the retry policy and circuit breaker.
    async fn establish(&self, cancel: &CancellationToken) -> Result<PooledConnection> {
        let admission = self.breaker.admit().map_err(|remaining| StrandError::CircuitOpen {
            capability: self.name.clone(),
            retry_in_ms: remaining.as_millis() as u64,
        })?;
        if admission == Admission::Probe {
            self.publish_circuit(CircuitState::HalfOpen);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if admission == Admission::Probe {
                        self.breaker.abandon_probe();
                    }
                    return Err(StrandError::Cancelled);
                }
                r = self.connector.connect() => r,
            };

            match result {
                Ok(conn) => {
                    if let Some(state) = self.breaker.record_success() {
                        self.publish_circuit(state);
                    }
                    self.established.fetch_add(1, Ordering::Relaxed);
                    debug!(capability = %self.name, attempt, "Connection established");
                    return Ok(PooledConnection::new(conn, self.config.lease_ttl()));
                }
                Err(ConnectError::Transient(message)) => {
                    if let Some(state) = self.retry.next(attempt, ErrorKind::Transient) {
                        let delay_ms = state.delay.as_millis() as u64;
                        warn!(
                            capability = %self.name,
                            attempt,
                            max_attempts = self.retry.max_attempts(),
                            backoff_ms = delay_ms,
                            error = %message,
                            "Retrying connection"
                        );
                        self.events.publish(RunEvent::ConnectionRetrying {
                            capability: self.name.clone(),
                            attempt,
                            delay_ms,
                            error: message,
                        });
                        if !sleep_or_cancel(state.delay, cancel).await {
                            if admission == Admission::Probe {
                                self.breaker.abandon_probe();
                            }
                            return Err(StrandError::Cancelled);
                        }
                        continue;
                    }
                    self.trip();
                    return Err(StrandError::PermanentConnection {
                        capability: self.name.clone(),
                        message: format!("gave up after {} attempts: {}", attempt, message),
                    });
                }
                Err(ConnectError::Permanent(message)) => {
                    self.trip();
                    return Err(StrandError::PermanentConnection {
                        capability: self.name.clone(),
                        message,
                    });
                }
            }
        }
    }

    fn trip(&self) {
        if let Some(state) = self.breaker.record_failure() {
            self.publish_circuit(state);
        }
    }

    fn publish_circuit(&self, state: CircuitState) {
        self.events.publish(RunEvent::CircuitStateChanged {
            capability: self.name.clone(),
            state,
        });
    }

    /// Return a leased connection. Called from `Lease::drop`.
    pub(crate) fn checkin(&self, pooled: &PooledConnection, lease_id: Uuid) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if pooled.is_expired() || !pooled.conn.is_healthy() {
            debug!(capability = %self.name, %lease_id, "Closing connection on release");
            pooled.conn.close();
        } else {
            self.idle.lock().push(pooled.clone());
        }
        debug!(capability = %self.name, %lease_id, in_flight = remaining, "Lease released");
        self.events.publish(RunEvent::LeaseReleased {
            capability: self.name.clone(),
            lease_id: lease_id.to_string(),
        });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.config.pool_capacity,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            established: self.established.load(Ordering::Relaxed),
            circuit: self.breaker.state(),
        }
    }

    /// Close every idle connection.
    pub fn drain(&self) {
        let drained: Vec<PooledConnection> = self.idle.lock().drain(..).collect();
        for pooled in drained {
            pooled.conn.close();
        }
    }
}
