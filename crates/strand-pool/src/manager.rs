use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strand_core::config::CapabilityConfig;
use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::traits::Connector;

use crate::lease::Lease;
use crate::pool::{CapabilityPool, PoolStats};

/// Owns one connection pool per named capability for the lifetime of a run.
pub struct ConnectionManager {
    pools: HashMap<String, Arc<CapabilityPool>>,
    events: Arc<EventBus>,
}

impl ConnectionManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            pools: HashMap::new(),
            events,
        }
    }

    /// Build a manager for every declared capability.
    ///
    /// Each declared capability needs a connector; connectors without a
    /// declaration get default pool settings.
    pub fn from_config(
        capabilities: &BTreeMap<String, CapabilityConfig>,
        mut connectors: HashMap<String, Arc<dyn Connector>>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let mut manager = Self::new(events);
        for (name, config) in capabilities {
            let connector = connectors.remove(name).ok_or_else(|| {
                StrandError::Config(format!("No connector registered for capability '{}'", name))
            })?;
            manager.register(name.clone(), config.clone(), connector);
        }
        for (name, connector) in connectors {
            manager.register(name, CapabilityConfig::default(), connector);
        }
        Ok(manager)
    }

    /// Register a capability pool. Replaces any previous pool of that name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        config: CapabilityConfig,
        connector: Arc<dyn Connector>,
    ) {
        let name = name.into();
        info!(capability = %name, capacity = config.pool_capacity, "Capability registered");
        let pool = CapabilityPool::new(name.clone(), config, connector, self.events.clone());
        self.pools.insert(name, Arc::new(pool));
    }

    /// The event bus shared with the pools.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// The configured lease wait for a capability.
    pub fn acquire_timeout(&self, capability: &str) -> Option<Duration> {
        self.pools.get(capability).map(|p| p.config().acquire_timeout())
    }

    /// Lease one connection, waiting at most `timeout` for a free slot.
    pub async fn acquire(
        &self,
        capability: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let pool = self
            .pools
            .get(capability)
            .ok_or_else(|| StrandError::UnknownCapability(capability.to_string()))?;
        pool.acquire(timeout, cancel).await
    }

    /// Lease one connection of every named capability, each with its
    /// configured wait.
    ///
    /// Capabilities are acquired in sorted order so concurrent callers never
    /// hold-and-wait in opposite orders. On failure, leases already taken are
    /// released before the error is returned.
    pub async fn acquire_all<'a, I>(
        &self,
        capabilities: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<Lease>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let ordered: BTreeSet<&String> = capabilities.into_iter().collect();
        let mut leases = Vec::with_capacity(ordered.len());
        for capability in ordered {
            let timeout = self
                .acquire_timeout(capability)
                .ok_or_else(|| StrandError::UnknownCapability(capability.clone()))?;
            leases.push(self.acquire(capability, timeout, cancel).await?);
        }
        Ok(leases)
    }

    /// Return a lease to its pool.
    pub fn release(&self, lease: Lease) {
        debug!(capability = %lease.capability(), lease_id = %lease.lease_id(), "Releasing lease");
        lease.release();
    }

    pub fn stats(&self, capability: &str) -> Option<PoolStats> {
        self.pools.get(capability).map(|p| p.stats())
    }

    /// Leases currently held across all capabilities.
    pub fn outstanding(&self) -> usize {
        self.pools.values().map(|p| p.in_flight()).sum()
    }

    /// Close all idle connections. Leases still held close on release.
    pub fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.drain();
        }
        info!("Connection pools drained");
    }
}
