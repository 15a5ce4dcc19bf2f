use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Keyed output produced by a single node.
pub type OutputMap = BTreeMap<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a node within one run.
///
/// Transitions only move forward: `Pending → Ready → Running → {Succeeded, Failed}`,
/// with `Skipped` reachable from `Pending` and `Cancelled` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a per-capability circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Input handed to a node: the committed outputs of its prerequisites.
///
/// Entries are grouped by producer node id. Optional prerequisites that
/// failed or were skipped contribute no entries and are listed as degraded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    entries: BTreeMap<String, OutputMap>,
    degraded: BTreeSet<String>,
}

impl NodeInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        producer: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.entries
            .entry(producer.into())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn mark_degraded(&mut self, producer: impl Into<String>) {
        self.degraded.insert(producer.into());
    }

    /// Get a single value written by `producer` under `key`.
    pub fn get(&self, producer: &str, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(producer).and_then(|m| m.get(key))
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, producer: &str, key: &str) -> Option<&str> {
        self.get(producer, key).and_then(|v| v.as_str())
    }

    /// All outputs of one producer.
    pub fn from_producer(&self, producer: &str) -> Option<&OutputMap> {
        self.entries.get(producer)
    }

    pub fn producers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn is_degraded(&self, producer: &str) -> bool {
        self.degraded.contains(producer)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &str> {
        self.degraded.iter().map(|s| s.as_str())
    }

    pub fn has_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Number of individual entries across all producers.
    pub fn len(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into `producer.key` → value.
    pub fn flatten(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries
            .iter()
            .flat_map(|(producer, map)| {
                map.iter()
                    .map(move |(k, v)| (format!("{}.{}", producer, k), v.clone()))
            })
            .collect()
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        nodes: usize,
    },
    NodeStateChanged {
        node_id: String,
        from: NodeState,
        to: NodeState,
    },
    NodeRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ConnectionRetrying {
        capability: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    LeaseAcquired {
        capability: String,
        lease_id: String,
    },
    LeaseReleased {
        capability: String,
        lease_id: String,
    },
    CircuitStateChanged {
        capability: String,
        state: CircuitState,
    },
    RunFinished {
        run_id: String,
        exit_code: i32,
    },
}
