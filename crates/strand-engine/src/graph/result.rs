use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use strand_core::error::{ErrorClass, ErrorKind, StrandError};
use strand_core::types::{NodeState, OutputMap, RunId};

/// Error recorded against a node that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeError {
    /// Originating error class. Skipped nodes carry the class of the failure
    /// that caused the skip.
    pub class: ErrorClass,
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(class: ErrorClass, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            class,
            kind,
            message: message.into(),
        }
    }

    /// A node skipped because prerequisite `prerequisite` ended with `cause`.
    pub fn skipped(prerequisite: &str, cause: &NodeError) -> Self {
        Self {
            class: cause.class,
            kind: ErrorKind::Permanent,
            message: format!("prerequisite '{}' did not succeed: {}", prerequisite, cause.message),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorClass::Cancelled, ErrorKind::Permanent, reason)
    }
}

impl From<&StrandError> for NodeError {
    fn from(err: &StrandError) -> Self {
        Self {
            class: err.class(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Final record of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    pub id: String,
    pub agent: String,
    pub optional: bool,
    pub state: NodeState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded_inputs: Vec<String>,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every non-optional node succeeded.
    Succeeded,
    /// At least one non-optional node failed or was skipped.
    Failed,
    /// A fatal error aborted the run.
    Fatal,
    /// The run was cancelled from outside.
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Fatal | RunStatus::Cancelled => 2,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Fatal => write!(f, "fatal"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of executing an entire graph.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Per-node results in declaration order.
    pub nodes: Vec<NodeResult>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: Vec<String>,
    /// The error that aborted the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<NodeError>,
    /// Committed outputs, by producer.
    pub outputs: BTreeMap<String, OutputMap>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    /// Assemble the summary sets and status from per-node records.
    pub(crate) fn assemble(
        run_id: RunId,
        nodes: Vec<NodeResult>,
        fatal_error: Option<NodeError>,
        externally_cancelled: bool,
        outputs: BTreeMap<String, OutputMap>,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Self {
        let ids_in = |state: NodeState| -> Vec<String> {
            nodes
                .iter()
                .filter(|n| n.state == state)
                .map(|n| n.id.clone())
                .collect()
        };
        let succeeded = ids_in(NodeState::Succeeded);
        let failed = ids_in(NodeState::Failed);
        let skipped = ids_in(NodeState::Skipped);
        let cancelled = ids_in(NodeState::Cancelled);

        let status = if fatal_error.is_some() {
            RunStatus::Fatal
        } else if externally_cancelled {
            RunStatus::Cancelled
        } else if nodes
            .iter()
            .any(|n| !n.optional && n.state != NodeState::Succeeded)
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        Self {
            run_id,
            status,
            nodes,
            succeeded,
            failed,
            skipped,
            cancelled,
            fatal_error,
            outputs,
            started_at,
            elapsed_ms,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn node(&self, id: &str) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "run {} {}: {} succeeded, {} failed, {} skipped, {} cancelled in {}ms",
            self.run_id,
            self.status,
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.cancelled.len(),
            self.elapsed_ms
        )
    }
}
