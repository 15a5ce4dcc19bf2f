use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::error::{Result, StrandError, UnitError};
use strand_core::event::EventBus;
use strand_core::types::{NodeInput, OutputMap, RunEvent};
use strand_pool::{sleep_or_cancel, ConnectionManager, RetryPolicy};

use super::context::ContextStore;
use super::dependency::DependencyGraph;
use super::node::AgentDescriptor;
use crate::unit::{ExecutionUnit, UnitContext};

/// How a node's worker finished.
#[derive(Debug)]
pub(crate) enum NodeOutcome {
    Succeeded,
    Failed(StrandError),
    /// The node failed in a way that must abort the run.
    Fatal(StrandError),
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct NodeReport {
    pub outcome: NodeOutcome,
    pub attempts: u32,
}

/// Drives one node through initialize, its attempts, and cleanup.
pub(crate) struct NodeTask {
    pub index: usize,
    pub graph: Arc<DependencyGraph>,
    pub unit: Arc<dyn ExecutionUnit>,
    pub input: NodeInput,
    pub connections: Arc<ConnectionManager>,
    pub context: Arc<ContextStore>,
    pub events: Arc<EventBus>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl NodeTask {
    fn descriptor(&self) -> &AgentDescriptor {
        self.graph.node(self.index)
    }

    pub async fn run(self) -> NodeReport {
        let node_id = self.descriptor().id.clone();
        let mut attempts = 0u32;

        let initialized = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StrandError::Cancelled),
            r = AssertUnwindSafe(async { self.unit.initialize().await }).catch_unwind() => match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(StrandError::unit(&node_id, e)),
                Err(panic) => Err(StrandError::unit(
                    &node_id,
                    UnitError::permanent(format!("initialize panicked: {}", panic_message(&*panic))),
                )),
            },
        };

        let result = match initialized {
            Ok(()) => self.run_attempts(&node_id, &mut attempts).await,
            Err(e) => Err(e),
        };

        self.cleanup(&node_id).await;

        let outcome = match result {
            Ok(()) => NodeOutcome::Succeeded,
            Err(StrandError::Cancelled) => NodeOutcome::Cancelled,
            Err(_) if self.cancel.is_cancelled() => NodeOutcome::Cancelled,
            Err(e) if e.is_fatal() => NodeOutcome::Fatal(e),
            Err(e) => NodeOutcome::Failed(e),
        };
        NodeReport { outcome, attempts }
    }

    async fn run_attempts(&self, node_id: &str, attempts: &mut u32) -> Result<()> {
        loop {
            *attempts += 1;
            let attempt = *attempts;

            let err = match self.attempt(node_id, attempt).await {
                Ok(outputs) => {
                    self.context.commit(node_id, outputs)?;
                    return Ok(());
                }
                Err(e) => e,
            };

            if matches!(err, StrandError::Cancelled) || self.cancel.is_cancelled() {
                return Err(StrandError::Cancelled);
            }

            let Some(state) = self.retry.next(attempt, err.kind()) else {
                return Err(err);
            };

            let delay_ms = state.delay.as_millis() as u64;
            warn!(
                node_id,
                attempt,
                max_attempts = self.retry.max_attempts(),
                backoff_ms = delay_ms,
                error = %err,
                "Retrying node"
            );
            self.events.publish(RunEvent::NodeRetrying {
                node_id: node_id.to_string(),
                attempt,
                delay_ms,
                error: err.to_string(),
            });
            if !sleep_or_cancel(state.delay, &self.cancel).await {
                return Err(StrandError::Cancelled);
            }
        }
    }

    /// One attempt: lease, execute, release, validate.
    async fn attempt(&self, node_id: &str, attempt: u32) -> Result<OutputMap> {
        let descriptor = self.descriptor();
        let leases = self
            .connections
            .acquire_all(&descriptor.capabilities, &self.cancel)
            .await?;

        debug!(node_id, attempt, leases = leases.len(), "Executing node");
        let attempt_cancel = self.cancel.child_token();
        let ctx = UnitContext {
            node_id,
            attempt,
            input: &self.input,
            config: &descriptor.config,
            leases: &leases,
            connections: &self.connections,
            cancel: attempt_cancel.clone(),
        };
        // Built lazily so a panic before the future exists is still caught.
        let execution =
            AssertUnwindSafe(async move { self.unit.execute(ctx).await }).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StrandError::Cancelled),
            r = tokio::time::timeout(self.timeout, execution) => match r {
                Ok(Ok(Ok(outputs))) => Ok(outputs),
                Ok(Ok(Err(e))) => Err(StrandError::unit(node_id, e)),
                Ok(Err(panic)) => Err(StrandError::unit(
                    node_id,
                    UnitError::permanent(format!("execute panicked: {}", panic_message(&*panic))),
                )),
                Err(_) => {
                    attempt_cancel.cancel();
                    Err(StrandError::Timeout {
                        node: node_id.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
            },
        };

        for lease in leases {
            self.connections.release(lease);
        }

        let outputs = result?;
        let validated = std::panic::catch_unwind(AssertUnwindSafe(|| self.unit.validate(&outputs)));
        let rejected = match validated {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.message),
            Err(panic) => Some(format!("validate panicked: {}", panic_message(&*panic))),
        };
        if let Some(reason) = rejected {
            return Err(StrandError::Validation(format!(
                "node '{}' output rejected: {}",
                node_id, reason
            )));
        }
        Ok(outputs)
    }

    /// Always runs, bounded by the node timeout.
    async fn cleanup(&self, node_id: &str) {
        let cleanup = AssertUnwindSafe(async { self.unit.cleanup().await }).catch_unwind();
        match tokio::time::timeout(self.timeout, cleanup).await {
            Ok(Ok(())) => debug!(node_id, "Node cleaned up"),
            Ok(Err(panic)) => warn!(node_id, panic = %panic_message(&*panic), "Cleanup panicked"),
            Err(_) => warn!(node_id, "Cleanup timed out"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
