use std::collections::HashMap;
use std::sync::Arc;

use strand_core::error::{Result, StrandError, UnitError};

use crate::graph::node::AgentDescriptor;
use crate::unit::ExecutionUnit;

/// Builds a unit for one node from its descriptor.
pub type UnitFactory =
    Arc<dyn Fn(&AgentDescriptor) -> std::result::Result<Arc<dyn ExecutionUnit>, UnitError> + Send + Sync>;

struct Registration {
    version: String,
    factory: UnitFactory,
}

/// Registry of available agents.
pub struct UnitRegistry {
    agents: HashMap<String, Registration>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent factory. Replaces any previous registration.
    pub fn register<F>(&mut self, agent: impl Into<String>, version: impl Into<String>, factory: F)
    where
        F: Fn(&AgentDescriptor) -> std::result::Result<Arc<dyn ExecutionUnit>, UnitError>
            + Send
            + Sync
            + 'static,
    {
        self.agents.insert(
            agent.into(),
            Registration {
                version: version.into(),
                factory: Arc::new(factory),
            },
        );
    }

    /// Register a single shared unit instance for every node of that agent.
    pub fn register_shared(
        &mut self,
        agent: impl Into<String>,
        version: impl Into<String>,
        unit: Arc<dyn ExecutionUnit>,
    ) {
        self.register(agent, version, move |_| Ok(unit.clone()));
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    pub fn version(&self, agent: &str) -> Option<&str> {
        self.agents.get(agent).map(|r| r.version.as_str())
    }

    /// Registered agent names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Create the unit for one node.
    ///
    /// Unknown agents, version mismatches and factory failures are
    /// configuration errors.
    pub fn instantiate(&self, node: &AgentDescriptor) -> Result<Arc<dyn ExecutionUnit>> {
        let registration = self.agents.get(&node.agent).ok_or_else(|| {
            StrandError::Config(format!(
                "node '{}' uses unknown agent '{}'",
                node.id, node.agent
            ))
        })?;

        if let Some(wanted) = &node.version {
            if wanted != &registration.version {
                return Err(StrandError::Config(format!(
                    "node '{}' requires {} version {}, registered version is {}",
                    node.id, node.agent, wanted, registration.version
                )));
            }
        }

        (registration.factory)(node).map_err(|e| {
            StrandError::Config(format!(
                "failed to create agent '{}' for node '{}': {}",
                node.agent, node.id, e.message
            ))
        })
    }
}
