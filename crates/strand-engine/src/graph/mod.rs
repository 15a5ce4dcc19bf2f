//! Graph execution: a validated dependency graph, the per-run context store
//! and the scheduler that drives every node through its state machine.
//!
//! A workflow is a set of `AgentDescriptor`s whose `depends_on` lists form a
//! DAG. The `Scheduler` launches ready nodes up to a parallelism bound, hands
//! each one the committed outputs of its prerequisites, and aggregates a
//! `RunResult` once every node is terminal.

pub mod context;
pub mod dependency;
pub mod node;
pub mod result;
pub mod scheduler;
mod worker;

pub use context::{ContextEntry, ContextKey, ContextStore};
pub use dependency::DependencyGraph;
pub use node::{AgentDescriptor, ExecutionNode};
pub use result::{NodeError, NodeResult, RunResult, RunStatus};
pub use scheduler::{RunSettings, Scheduler};
