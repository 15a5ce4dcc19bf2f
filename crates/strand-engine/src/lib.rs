pub mod graph;
pub mod registry;
pub mod unit;

pub use graph::{
    AgentDescriptor, ContextEntry, ContextKey, ContextStore, DependencyGraph, ExecutionNode,
    NodeError, NodeResult, RunResult, RunSettings, RunStatus, Scheduler,
};
pub use registry::{UnitFactory, UnitRegistry};
pub use unit::{ExecutionUnit, UnitContext};
