//! Shared test utilities for Strand crates: scripted units, scripted
//! connectors and graph fixtures.

pub mod connector;
pub mod fixtures;
pub mod unit;

use std::sync::Arc;

use strand_core::config::CapabilityConfig;
use strand_core::event::EventBus;
use strand_engine::{ExecutionUnit, UnitRegistry};
use strand_pool::ConnectionManager;

pub use connector::{MockConnection, MockConnector};
pub use fixtures::{chain, cycle, diamond, fast_retry, settings, workflow_file};
pub use unit::{Execution, MockUnit, Step};

/// Register each unit under its agent name.
pub fn registry(units: &[(&str, Arc<MockUnit>)]) -> UnitRegistry {
    let mut registry = UnitRegistry::new();
    for (agent, unit) in units {
        let unit: Arc<dyn ExecutionUnit> = unit.clone();
        registry.register_shared(*agent, "1.0", unit);
    }
    registry
}

/// A manager with one pool per `(name, capacity, connector)`.
pub fn connections(pools: Vec<(&str, usize, Arc<MockConnector>)>) -> Arc<ConnectionManager> {
    let mut manager = ConnectionManager::new(Arc::new(EventBus::default()));
    for (name, capacity, connector) in pools {
        let config = CapabilityConfig {
            pool_capacity: capacity,
            acquire_timeout_ms: 60_000,
            retry: fast_retry(3),
            ..CapabilityConfig::default()
        };
        manager.register(name, config, connector);
    }
    Arc::new(manager)
}
