use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use strand_core::error::{ConnectError, ErrorClass, StrandError, UnitError};
use strand_core::types::NodeState;
use strand_engine::{AgentDescriptor, DependencyGraph, RunStatus, Scheduler};
use strand_test_utils::{
    chain, connections, cycle, diamond, registry, settings, MockConnector, MockUnit, Step,
};

fn unit(name: &str) -> Arc<MockUnit> {
    Arc::new(MockUnit::returning(name, "out", json!(name)))
}

#[tokio::test]
async fn test_chain_with_transient_retries() {
    let a = unit("a");
    let b = Arc::new(MockUnit::returning("b", "out", json!("b")).failing_transiently(2));
    let c = unit("c");

    let scheduler = Scheduler::new(
        DependencyGraph::new(chain(&["a", "b", "c"])).unwrap(),
        &registry(&[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]),
        connections(vec![]),
        settings(4),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.state_of("a"), Some(NodeState::Succeeded));
    assert_eq!(result.state_of("b"), Some(NodeState::Succeeded));
    assert_eq!(result.state_of("c"), Some(NodeState::Succeeded));
    assert_eq!(result.node("b").unwrap().attempts, 3);
    assert_eq!(result.node("a").unwrap().attempts, 1);
    assert_eq!(result.exit_code(), 0);

    assert_eq!(b.execute_calls(), 3);
    assert_eq!(b.initialize_calls(), 1);
    assert_eq!(b.cleanup_calls(), 1);

    // c saw b's committed output, and only its direct prerequisite
    let seen = &c.executions()[0].input;
    assert_eq!(seen.get("b", "out"), Some(&json!("b")));
    assert_eq!(seen.get("a", "out"), None);
}

#[tokio::test]
async fn test_diamond_with_permanent_failure() {
    let a = unit("a");
    let b = Arc::new(MockUnit::new("b").with_steps([Step::fail(UnitError::permanent("nope"))]));
    let c = unit("c");
    let d = unit("d");

    let scheduler = Scheduler::new(
        DependencyGraph::new(diamond()).unwrap(),
        &registry(&[("a", a), ("b", b.clone()), ("c", c), ("d", d.clone())]),
        connections(vec![]),
        settings(4),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.state_of("a"), Some(NodeState::Succeeded));
    assert_eq!(result.state_of("b"), Some(NodeState::Failed));
    assert_eq!(result.state_of("c"), Some(NodeState::Succeeded));
    assert_eq!(result.state_of("d"), Some(NodeState::Skipped));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_code(), 1);

    // Permanent errors are not retried
    assert_eq!(result.node("b").unwrap().attempts, 1);
    assert_eq!(b.execute_calls(), 1);

    let skipped = result.node("d").unwrap();
    assert_eq!(skipped.error.as_ref().map(|e| e.class), Some(ErrorClass::Execution));
    assert_eq!(d.initialize_calls(), 0);
    assert_eq!(d.execute_calls(), 0);

    assert_eq!(result.succeeded, vec!["a", "c"]);
    assert_eq!(result.failed, vec!["b"]);
    assert_eq!(result.skipped, vec!["d"]);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_execution() {
    let err = DependencyGraph::new(cycle()).unwrap_err();
    assert!(matches!(err, StrandError::Graph(_)));
    assert!(err.to_string().contains("Cycle detected"));
}

#[tokio::test(start_paused = true)]
async fn test_pool_capacity_bounds_concurrent_leases() {
    let connector = MockConnector::new();
    let pools = connections(vec![("db", 2, connector.clone())]);
    let worker = Arc::new(
        MockUnit::returning("worker", "done", json!(true)).with_delay(Duration::from_millis(50)),
    );

    let nodes: Vec<AgentDescriptor> = (0..5)
        .map(|i| AgentDescriptor::new(format!("n{}", i), "worker").with_capabilities(["db"]))
        .collect();
    let scheduler = Scheduler::new(
        DependencyGraph::new(nodes).unwrap(),
        &registry(&[("worker", worker.clone())]),
        pools.clone(),
        settings(5),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.succeeded.len(), 5);

    let stats = pools.stats("db").unwrap();
    assert_eq!(stats.peak_in_flight, 2);
    assert_eq!(stats.in_flight, 0);
    assert!(connector.established() <= 2);
    assert_eq!(worker.peak_concurrency(), 2);
    assert_eq!(pools.outstanding(), 0);

    for execution in worker.executions() {
        assert_eq!(execution.capabilities, vec!["db"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_run() {
    let connector = MockConnector::new();
    let pools = connections(vec![("db", 2, connector.clone())]);
    let slow = Arc::new(MockUnit::new("slow").with_delay(Duration::from_secs(10)));
    let after = unit("after");

    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![
            AgentDescriptor::new("s1", "slow").with_capabilities(["db"]),
            AgentDescriptor::new("s2", "slow").with_capabilities(["db"]),
            AgentDescriptor::new("after", "after").depends_on(["s1"]),
        ])
        .unwrap(),
        &registry(&[("slow", slow.clone()), ("after", after.clone())]),
        pools.clone(),
        settings(4),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = scheduler.run(cancel).await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.exit_code(), 2);
    assert_eq!(result.cancelled, vec!["s1", "s2", "after"]);

    // Both started nodes were cleaned up, the unstarted one never initialized
    assert_eq!(slow.initialize_calls(), 2);
    assert_eq!(slow.cleanup_calls(), 2);
    assert_eq!(after.initialize_calls(), 0);

    assert_eq!(pools.outstanding(), 0);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_nodes_overlap() {
    let a = Arc::new(MockUnit::new("a").with_delay(Duration::from_millis(100)));
    let b = Arc::new(MockUnit::new("b").with_delay(Duration::from_millis(100)));
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![AgentDescriptor::new("a", "a"), AgentDescriptor::new("b", "b")])
            .unwrap(),
        &registry(&[("a", a.clone()), ("b", b.clone())]),
        connections(vec![]),
        settings(2),
    )
    .unwrap();
    scheduler.run(CancellationToken::new()).await;

    let (a_start, a_end) = a.intervals()[0];
    let (b_start, b_end) = b.intervals()[0];
    assert!(a_start < b_end && b_start < a_end);
}

#[tokio::test(start_paused = true)]
async fn test_parallelism_one_serializes() {
    let a = Arc::new(MockUnit::new("a").with_delay(Duration::from_millis(100)));
    let b = Arc::new(MockUnit::new("b").with_delay(Duration::from_millis(100)));
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![AgentDescriptor::new("a", "a"), AgentDescriptor::new("b", "b")])
            .unwrap(),
        &registry(&[("a", a.clone()), ("b", b.clone())]),
        connections(vec![]),
        settings(1),
    )
    .unwrap();
    scheduler.run(CancellationToken::new()).await;

    // Declaration order decides who goes first
    let (_, a_end) = a.intervals()[0];
    let (b_start, _) = b.intervals()[0];
    assert!(a_end <= b_start);
}

#[tokio::test]
async fn test_exhausted_attempts_fail_after_exactly_max() {
    let flaky = Arc::new(MockUnit::new("flaky").failing_transiently(5));
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![AgentDescriptor::new("x", "flaky").with_max_attempts(4)])
            .unwrap(),
        &registry(&[("flaky", flaky.clone())]),
        connections(vec![]),
        settings(1),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    let x = result.node("x").unwrap();
    assert_eq!(x.state, NodeState::Failed);
    assert_eq!(x.attempts, 4);
    assert_eq!(flaky.execute_calls(), 4);
}

#[tokio::test]
async fn test_flaky_connector_is_retried() {
    let connector = MockConnector::flaky(2);
    let pools = connections(vec![("search", 1, connector.clone())]);
    let a = unit("a");
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![AgentDescriptor::new("a", "a").with_capabilities(["search"])])
            .unwrap(),
        &registry(&[("a", a.clone())]),
        pools,
        settings(1),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.state_of("a"), Some(NodeState::Succeeded));
    // Connection retries are not node attempts
    assert_eq!(result.node("a").unwrap().attempts, 1);
    assert_eq!(connector.connect_attempts(), 3);
}

#[tokio::test]
async fn test_permanent_connection_failure_skips_dependents() {
    let connector =
        MockConnector::scripted(vec![ConnectError::Permanent("bad credentials".into())]);
    let pools = connections(vec![("search", 1, connector)]);
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![
            AgentDescriptor::new("fetch", "fetch").with_capabilities(["search"]),
            AgentDescriptor::new("report", "report").depends_on(["fetch"]),
        ])
        .unwrap(),
        &registry(&[("fetch", unit("fetch")), ("report", unit("report"))]),
        pools,
        settings(2),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    let fetch = result.node("fetch").unwrap();
    assert_eq!(fetch.state, NodeState::Failed);
    assert_eq!(
        fetch.error.as_ref().map(|e| e.class),
        Some(ErrorClass::PermanentConnection)
    );
    let report = result.node("report").unwrap();
    assert_eq!(report.state, NodeState::Skipped);
    assert_eq!(
        report.error.as_ref().map(|e| e.class),
        Some(ErrorClass::PermanentConnection)
    );
}

#[tokio::test]
async fn test_fatal_initialize_aborts_run() {
    let broken = Arc::new(MockUnit::new("broken").with_init_error(UnitError::fatal("no key")));
    let scheduler = Scheduler::new(
        DependencyGraph::new(chain(&["broken", "next"])).unwrap(),
        &registry(&[("broken", broken.clone()), ("next", unit("next"))]),
        connections(vec![]),
        settings(1),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Fatal);
    assert_eq!(result.state_of("broken"), Some(NodeState::Failed));
    assert_eq!(result.state_of("next"), Some(NodeState::Cancelled));
    assert_eq!(broken.execute_calls(), 0);
    assert_eq!(broken.cleanup_calls(), 1);
}

#[tokio::test]
async fn test_optional_prerequisite_passes_degraded_marker() {
    let lint = Arc::new(MockUnit::new("lint").with_steps([Step::fail(UnitError::permanent("x"))]));
    let docs = unit("docs");
    let scheduler = Scheduler::new(
        DependencyGraph::new(vec![
            AgentDescriptor::new("scan", "scan"),
            AgentDescriptor::new("lint", "lint").optional(),
            AgentDescriptor::new("docs", "docs").depends_on(["scan", "lint"]),
        ])
        .unwrap(),
        &registry(&[("scan", unit("scan")), ("lint", lint), ("docs", docs.clone())]),
        connections(vec![]),
        settings(2),
    )
    .unwrap();
    let result = scheduler.run(CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.state_of("docs"), Some(NodeState::Succeeded));
    let input = &docs.executions()[0].input;
    assert!(input.is_degraded("lint"));
    assert_eq!(input.get("scan", "out"), Some(&json!("scan")));
}
