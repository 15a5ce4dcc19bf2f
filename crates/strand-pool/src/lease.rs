use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use strand_core::traits::Connection;

use crate::pool::{CapabilityPool, PooledConnection};

/// Exclusive, time-bounded right to one pooled connection.
///
/// Dropping the lease returns the connection to its pool (or closes it once
/// expired) and frees the pool slot, so every exit path releases it.
pub struct Lease {
    lease_id: Uuid,
    acquired_at: DateTime<Utc>,
    pooled: PooledConnection,
    pool: Arc<CapabilityPool>,
    // Dropped after `Drop::drop` has checked the connection back in
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub(crate) fn new(
        pooled: PooledConnection,
        pool: Arc<CapabilityPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            acquired_at: Utc::now(),
            pooled,
            pool,
            _permit: permit,
        }
    }

    pub fn capability(&self) -> &str {
        self.pool.name()
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When the underlying connection was established.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.pooled.created_at
    }

    /// After this instant the connection is closed on release instead of reused.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.pooled.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.pooled.is_expired()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.pooled.conn
    }

    /// Borrow the connection as its concrete type.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.pooled.conn.as_any().downcast_ref::<T>()
    }

    /// Release explicitly. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("capability", &self.capability())
            .field("lease_id", &self.lease_id)
            .field("created_at", &self.pooled.created_at)
            .field("expires_at", &self.pooled.expires_at)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.checkin(&self.pooled, self.lease_id);
    }
}
