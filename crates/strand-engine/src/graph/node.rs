use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use strand_core::config::NodeConfig;
use strand_core::types::NodeState;

use super::result::NodeError;

/// Declarative description of one node in the workflow graph.
///
/// Descriptors are pure data: which agent implements the node, which
/// capabilities it leases, what it depends on and how failures propagate.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Unique identifier for this node.
    pub id: String,
    /// Registered agent implementing the node.
    pub agent: String,
    /// Required agent version, if pinned.
    pub version: Option<String>,
    /// Capabilities leased for each execute call.
    pub capabilities: BTreeSet<String>,
    /// Prerequisite node ids.
    pub depends_on: Vec<String>,
    /// Failure degrades dependents instead of skipping them.
    pub optional: bool,
    /// Attempt cap override.
    pub max_attempts: Option<u32>,
    /// Per-attempt execution timeout override.
    pub timeout: Option<Duration>,
    /// Agent-specific settings.
    pub config: serde_json::Value,
}

impl AgentDescriptor {
    /// Create a new descriptor with minimal configuration.
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            version: None,
            capabilities: BTreeSet::new(),
            depends_on: vec![],
            optional: false,
            max_attempts: None,
            timeout: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn from_config(node: &NodeConfig) -> Self {
        Self {
            id: node.id.clone(),
            agent: node.agent.clone(),
            version: node.version.clone(),
            capabilities: node.capabilities.iter().cloned().collect(),
            depends_on: node.depends_on.clone(),
            optional: node.optional,
            max_attempts: node.max_attempts,
            timeout: node.timeout_secs.map(Duration::from_secs),
            config: node.config.clone(),
        }
    }

    /// Pin the agent version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the required capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the prerequisite node ids.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the node optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Mutable per-run state of one node. Only the scheduler touches it.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub state: NodeState,
    pub attempts: u32,
    pub last_error: Option<NodeError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optional prerequisites that failed or were skipped.
    pub degraded_inputs: Vec<String>,
}

impl Default for ExecutionNode {
    fn default() -> Self {
        Self {
            state: NodeState::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            degraded_inputs: vec![],
        }
    }
}

impl ExecutionNode {
    /// Move to `next`, refusing any transition that would regress.
    pub fn transition(&mut self, next: NodeState) -> Result<NodeState, NodeState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        let previous = self.state;
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(previous)
    }
}
