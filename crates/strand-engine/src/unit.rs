use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use strand_core::error::UnitError;
use strand_core::types::{NodeInput, OutputMap};
use strand_pool::{ConnectionManager, Lease};

/// Everything a unit sees during one `execute` call.
#[derive(Clone)]
pub struct UnitContext<'a> {
    pub node_id: &'a str,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Committed outputs of the node's prerequisites.
    pub input: &'a NodeInput,
    /// The node's own settings from the workflow definition.
    pub config: &'a serde_json::Value,
    /// One lease per required capability, held for this call only.
    pub leases: &'a [Lease],
    pub connections: &'a ConnectionManager,
    /// Fires when the run is cancelled or the node times out.
    pub cancel: CancellationToken,
}

impl<'a> UnitContext<'a> {
    /// The lease held for `capability`.
    pub fn lease(&self, capability: &str) -> Option<&'a Lease> {
        self.leases.iter().find(|l| l.capability() == capability)
    }
}

/// Lifecycle contract every agent implements.
///
/// The scheduler calls `initialize` once, then `execute` once per attempt,
/// `validate` on each successful output, and `cleanup` exactly once whenever
/// `initialize` was called, whatever the outcome.
pub trait ExecutionUnit: Send + Sync + 'static {
    /// Agent name, used in logs.
    fn name(&self) -> &str;

    /// One-time setup before the first attempt.
    fn initialize(&self) -> BoxFuture<'_, Result<(), UnitError>> {
        Box::pin(async { Ok(()) })
    }

    /// Produce this node's outputs.
    fn execute<'a>(&'a self, ctx: UnitContext<'a>) -> BoxFuture<'a, Result<OutputMap, UnitError>>;

    /// Reject a successful but unusable output. A rejection fails the node
    /// without another attempt.
    fn validate(&self, output: &OutputMap) -> Result<(), UnitError> {
        let _ = output;
        Ok(())
    }

    /// Release unit-held resources.
    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
