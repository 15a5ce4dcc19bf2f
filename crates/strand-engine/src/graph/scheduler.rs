use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::{RetryConfig, RunConfig, WorkflowConfig};
use strand_core::error::{ErrorClass, ErrorKind, Result, StrandError, UnitError};
use strand_core::event::EventBus;
use strand_core::traits::Connector;
use strand_core::types::{NodeInput, NodeState, RunEvent, RunId};
use strand_pool::{ConnectionManager, RetryPolicy};

use super::context::ContextStore;
use super::dependency::DependencyGraph;
use super::node::ExecutionNode;
use super::result::{NodeError, NodeResult, RunResult};
use super::worker::{panic_message, NodeOutcome, NodeReport, NodeTask};
use crate::registry::UnitRegistry;
use crate::unit::ExecutionUnit;

/// Run-wide scheduling limits.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Maximum number of nodes running at once.
    pub max_parallelism: usize,
    /// Exceeding this aborts the run as fatal.
    pub global_timeout: Option<Duration>,
    /// Bound on a single `execute` attempt unless the node overrides it.
    /// Backoff and later attempts are not counted, so a retried node can
    /// run longer in total; `global_timeout` bounds the whole run.
    pub node_timeout: Duration,
    /// Node retry defaults.
    pub retry: RetryConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for RunSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism,
            global_timeout: config.global_timeout(),
            node_timeout: config.node_timeout(),
            retry: config.retry.clone(),
        }
    }
}

type Joined = (usize, std::thread::Result<NodeReport>);

/// Mutable bookkeeping of one run. Owned by the coordinator loop only.
struct RunState {
    nodes: Vec<ExecutionNode>,
    ready: BTreeSet<usize>,
    fatal_error: Option<NodeError>,
}

/// Executes a dependency graph with bounded parallelism.
///
/// The scheduler is the only owner of node state. Workers report an outcome
/// and the coordinator applies it, then recomputes readiness of the node's
/// dependents. Equally ready nodes start in declaration order.
pub struct Scheduler {
    graph: Arc<DependencyGraph>,
    units: Vec<Arc<dyn ExecutionUnit>>,
    connections: Arc<ConnectionManager>,
    context: Arc<ContextStore>,
    events: Arc<EventBus>,
    settings: RunSettings,
}

impl Scheduler {
    /// Prepare a run.
    ///
    /// Every agent is instantiated and every capability resolved here, so
    /// configuration problems surface before any node executes.
    pub fn new(
        graph: DependencyGraph,
        registry: &UnitRegistry,
        connections: Arc<ConnectionManager>,
        settings: RunSettings,
    ) -> Result<Self> {
        if settings.max_parallelism == 0 {
            return Err(StrandError::Config("max_parallelism must be at least 1".into()));
        }

        let mut units = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            if let Some(missing) = node
                .capabilities
                .iter()
                .find(|c| !connections.has_capability(c))
            {
                return Err(StrandError::Config(format!(
                    "node '{}' requires unknown capability '{}'",
                    node.id, missing
                )));
            }
            units.push(registry.instantiate(node)?);
        }

        Ok(Self {
            events: connections.events().clone(),
            graph: Arc::new(graph),
            units,
            connections,
            context: Arc::new(ContextStore::new()),
            settings,
        })
    }

    /// Build the graph, pools and units declared in a workflow file.
    pub fn from_config(
        config: &WorkflowConfig,
        registry: &UnitRegistry,
        connectors: HashMap<String, Arc<dyn Connector>>,
    ) -> Result<Self> {
        let graph = DependencyGraph::from_config(config)?;
        let events = Arc::new(EventBus::default());
        let connections = ConnectionManager::from_config(&config.capabilities, connectors, events)?;
        Self::new(
            graph,
            registry,
            Arc::new(connections),
            RunSettings::from(&config.run),
        )
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Execute the graph until every node is terminal.
    ///
    /// Cancelling `cancel` stops dispatching, cancels running nodes and
    /// returns once every worker has finished its cleanup.
    pub async fn run(self, cancel: CancellationToken) -> RunResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = Instant::now();
        let run_cancel = cancel.child_token();
        let deadline = self
            .settings
            .global_timeout
            .map(|t| tokio::time::Instant::now() + t);

        info!(
            run_id = %run_id,
            nodes = self.graph.len(),
            max_parallelism = self.settings.max_parallelism,
            "Run started"
        );
        self.events.publish(RunEvent::RunStarted {
            run_id: run_id.to_string(),
            nodes: self.graph.len(),
        });

        let mut state = RunState {
            nodes: vec![ExecutionNode::default(); self.graph.len()],
            ready: BTreeSet::new(),
            fatal_error: None,
        };
        for root in self.graph.roots() {
            self.transition(&mut state, root, NodeState::Ready);
            state.ready.insert(root);
        }

        let mut tasks: JoinSet<Joined> = JoinSet::new();
        loop {
            while !run_cancel.is_cancelled() && tasks.len() < self.settings.max_parallelism {
                let Some(idx) = state.ready.pop_first() else {
                    break;
                };
                self.dispatch(&mut state, idx, &mut tasks, &run_cancel);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, Ok(report)))) => self.settle(&mut state, idx, report, &run_cancel),
                    Some(Ok((idx, Err(panic)))) => {
                        let message = format!("worker panicked: {}", panic_message(&*panic));
                        let err = StrandError::unit(
                            &self.graph.node(idx).id,
                            UnitError::permanent(message),
                        );
                        let report = NodeReport {
                            outcome: NodeOutcome::Failed(err),
                            attempts: state.nodes[idx].attempts,
                        };
                        self.settle(&mut state, idx, report, &run_cancel);
                    }
                    Some(Err(e)) => error!(error = %e, "Node worker aborted"),
                    None => break,
                },
                _ = run_cancel.cancelled(), if !run_cancel.is_cancelled() => {
                    warn!(run_id = %run_id, running = tasks.len(), "Run cancelled, stopping nodes");
                }
                _ = sleep_until(deadline), if deadline.is_some() && !run_cancel.is_cancelled() => {
                    let timeout_ms = self
                        .settings
                        .global_timeout
                        .map(|t| t.as_millis() as u64)
                        .unwrap_or_default();
                    error!(run_id = %run_id, timeout_ms, "Run exceeded its global timeout");
                    state.fatal_error = Some(NodeError::new(
                        ErrorClass::Timeout,
                        ErrorKind::Fatal,
                        format!("run exceeded global timeout of {}ms", timeout_ms),
                    ));
                    run_cancel.cancel();
                }
            }
        }

        // Whatever never started ends cancelled
        let reason = match &state.fatal_error {
            Some(e) => format!("run aborted: {}", e.message),
            None => "run cancelled before node started".to_string(),
        };
        for idx in 0..state.nodes.len() {
            if !state.nodes[idx].state.is_terminal() {
                state.nodes[idx].last_error = Some(NodeError::cancelled(reason.clone()));
                self.transition(&mut state, idx, NodeState::Cancelled);
            }
        }

        self.connections.shutdown();

        let nodes = self
            .graph
            .nodes()
            .iter()
            .zip(state.nodes)
            .map(|(descriptor, node)| NodeResult {
                id: descriptor.id.clone(),
                agent: descriptor.agent.clone(),
                optional: descriptor.optional,
                state: node.state,
                attempts: node.attempts,
                error: node.last_error,
                started_at: node.started_at,
                finished_at: node.finished_at,
                degraded_inputs: node.degraded_inputs,
            })
            .collect();

        let result = RunResult::assemble(
            run_id,
            nodes,
            state.fatal_error,
            cancel.is_cancelled(),
            self.context.outputs(),
            started_at,
            start.elapsed().as_millis() as u64,
        );

        info!(
            run_id = %result.run_id,
            status = %result.status,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            cancelled = result.cancelled.len(),
            elapsed_ms = result.elapsed_ms,
            "Run finished"
        );
        self.events.publish(RunEvent::RunFinished {
            run_id: result.run_id.to_string(),
            exit_code: result.exit_code(),
        });
        result
    }

    fn dispatch(
        &self,
        state: &mut RunState,
        idx: usize,
        tasks: &mut JoinSet<Joined>,
        run_cancel: &CancellationToken,
    ) {
        let descriptor = self.graph.node(idx);
        self.transition(state, idx, NodeState::Running);
        state.nodes[idx].started_at = Some(Utc::now());

        // Prerequisites committed before this node became ready
        let succeeded = self
            .graph
            .prerequisites(idx)
            .iter()
            .filter(|&&p| state.nodes[p].state == NodeState::Succeeded)
            .map(|&p| self.graph.node(p).id.as_str());
        let mut input: NodeInput = self.context.input_for(succeeded);
        for degraded in &state.nodes[idx].degraded_inputs {
            input.mark_degraded(degraded.clone());
        }

        let mut retry = self.settings.retry.clone();
        if let Some(max) = descriptor.max_attempts {
            retry.max_attempts = max;
        }

        info!(
            node_id = %descriptor.id,
            agent = %descriptor.agent,
            inputs = input.len(),
            degraded = input.has_degraded(),
            "Node started"
        );

        let task = NodeTask {
            index: idx,
            graph: self.graph.clone(),
            unit: self.units[idx].clone(),
            input,
            connections: self.connections.clone(),
            context: self.context.clone(),
            events: self.events.clone(),
            retry: RetryPolicy::new(retry),
            timeout: descriptor.timeout.unwrap_or(self.settings.node_timeout),
            cancel: run_cancel.clone(),
        };
        tasks.spawn(async move {
            let index = task.index;
            (index, AssertUnwindSafe(task.run()).catch_unwind().await)
        });
    }

    /// Apply a worker's outcome and unlock (or skip) dependents.
    fn settle(
        &self,
        state: &mut RunState,
        idx: usize,
        report: NodeReport,
        run_cancel: &CancellationToken,
    ) {
        let node_id = &self.graph.node(idx).id;
        state.nodes[idx].attempts = report.attempts;

        match report.outcome {
            NodeOutcome::Succeeded => {
                info!(node_id = %node_id, attempts = report.attempts, "Node succeeded");
                self.transition(state, idx, NodeState::Succeeded);
                self.refresh_dependents(state, idx);
            }
            NodeOutcome::Failed(err) => {
                error!(
                    node_id = %node_id,
                    attempts = report.attempts,
                    class = %err.class(),
                    error = %err,
                    "Node failed"
                );
                state.nodes[idx].last_error = Some(NodeError::from(&err));
                self.transition(state, idx, NodeState::Failed);
                self.refresh_dependents(state, idx);
            }
            NodeOutcome::Fatal(err) => {
                error!(node_id = %node_id, error = %err, "Fatal node failure, aborting run");
                let node_error = NodeError::from(&err);
                state.nodes[idx].last_error = Some(node_error.clone());
                self.transition(state, idx, NodeState::Failed);
                if state.fatal_error.is_none() {
                    state.fatal_error = Some(node_error);
                }
                run_cancel.cancel();
            }
            NodeOutcome::Cancelled => {
                debug!(node_id = %node_id, "Node cancelled");
                state.nodes[idx].last_error =
                    Some(NodeError::cancelled("run cancelled while node was running"));
                self.transition(state, idx, NodeState::Cancelled);
            }
        }
    }

    /// Recompute readiness below `idx`. A non-optional prerequisite that did
    /// not succeed skips the dependent, and the skip cascades.
    fn refresh_dependents(&self, state: &mut RunState, idx: usize) {
        let mut stack = vec![idx];
        while let Some(settled) = stack.pop() {
            for &dep in self.graph.dependents(settled) {
                if state.nodes[dep].state != NodeState::Pending {
                    continue;
                }

                let mut all_terminal = true;
                let mut blocker = None;
                let mut degraded = Vec::new();
                for &p in self.graph.prerequisites(dep) {
                    let prerequisite = &state.nodes[p];
                    match prerequisite.state {
                        NodeState::Succeeded => {}
                        s if s.is_terminal() && self.graph.node(p).optional => degraded.push(p),
                        s if s.is_terminal() => {
                            blocker.get_or_insert(p);
                        }
                        _ => all_terminal = false,
                    }
                }

                if let Some(p) = blocker {
                    let prerequisite_id = &self.graph.node(p).id;
                    let cause = state.nodes[p].last_error.clone().unwrap_or_else(|| {
                        NodeError::new(
                            ErrorClass::Execution,
                            ErrorKind::Permanent,
                            "prerequisite did not succeed",
                        )
                    });
                    info!(
                        node_id = %self.graph.node(dep).id,
                        prerequisite = %prerequisite_id,
                        "Node skipped"
                    );
                    state.nodes[dep].last_error = Some(NodeError::skipped(prerequisite_id, &cause));
                    self.transition(state, dep, NodeState::Skipped);
                    stack.push(dep);
                } else if all_terminal {
                    state.nodes[dep].degraded_inputs = degraded
                        .into_iter()
                        .map(|p| self.graph.node(p).id.clone())
                        .collect();
                    self.transition(state, dep, NodeState::Ready);
                    state.ready.insert(dep);
                }
            }
        }
    }

    fn transition(&self, state: &mut RunState, idx: usize, next: NodeState) {
        let node_id = &self.graph.node(idx).id;
        match state.nodes[idx].transition(next) {
            Ok(from) => {
                debug!(node_id = %node_id, %from, to = %next, "Node state changed");
                self.events.publish(RunEvent::NodeStateChanged {
                    node_id: node_id.clone(),
                    from,
                    to: next,
                });
            }
            Err(current) => {
                warn!(node_id = %node_id, %current, to = %next, "Ignoring illegal state transition");
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
