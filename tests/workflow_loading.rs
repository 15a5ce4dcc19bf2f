use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use strand_core::config::WorkflowConfig;
use strand_core::error::StrandError;
use strand_core::traits::Connector;
use strand_core::types::NodeState;
use strand_engine::{DependencyGraph, Scheduler};
use strand_test_utils::{registry, workflow_file, MockConnector, MockUnit};

const WORKFLOW: &str = r#"
name = "release-notes"

[run]
max_parallelism = 2
node_timeout_secs = 30

[run.retry]
max_attempts = 2
initial_backoff_ms = 1
max_backoff_ms = 5
jitter = false

[capabilities.repo]
pool_capacity = 1
acquire_timeout_ms = 5000

[[nodes]]
id = "fetch"
agent = "fetch"
capabilities = ["repo"]

[[nodes]]
id = "changelog"
agent = "summarize"
version = "1.0"
depends_on = ["fetch"]
config = { style = "terse" }

[[nodes]]
id = "lint"
agent = "lint"
optional = true
"#;

fn connectors(connector: Arc<MockConnector>) -> HashMap<String, Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = connector;
    HashMap::from([("repo".to_string(), connector)])
}

#[tokio::test]
async fn test_load_and_run_workflow_file() {
    let file = workflow_file(WORKFLOW);
    let config = WorkflowConfig::load(file.path()).expect("load workflow");
    assert_eq!(config.name.as_deref(), Some("release-notes"));
    assert_eq!(config.nodes.len(), 3);

    let fetch = Arc::new(MockUnit::returning("fetch", "commits", json!(12)));
    let summarize = Arc::new(MockUnit::returning("summarize", "text", json!("notes")));
    let lint = Arc::new(MockUnit::new("lint"));
    let registry = registry(&[
        ("fetch", fetch.clone()),
        ("summarize", summarize.clone()),
        ("lint", lint),
    ]);

    let connector = MockConnector::new();
    let scheduler = Scheduler::from_config(&config, &registry, connectors(connector.clone()))
        .expect("build scheduler");
    assert_eq!(scheduler.settings().max_parallelism, 2);

    let result = scheduler.run(CancellationToken::new()).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.state_of("changelog"), Some(NodeState::Succeeded));
    assert_eq!(result.outputs["changelog"]["text"], json!("notes"));
    assert_eq!(
        summarize.executions()[0].input.get("fetch", "commits"),
        Some(&json!(12))
    );
    assert_eq!(fetch.executions()[0].capabilities, vec!["repo"]);
    assert_eq!(connector.established(), 1);
}

#[test]
fn test_missing_file() {
    let err = WorkflowConfig::load(Path::new("/nonexistent/strand.toml")).unwrap_err();
    assert!(matches!(err, StrandError::ConfigNotFound(_)));
}

#[test]
fn test_unknown_agent_fails_before_run() {
    let file = workflow_file(WORKFLOW);
    let config = WorkflowConfig::load(file.path()).unwrap();
    let registry = registry(&[("fetch", Arc::new(MockUnit::new("fetch")))]);

    let err = Scheduler::from_config(&config, &registry, connectors(MockConnector::new()))
        .err()
        .expect("unknown agent rejected");
    assert!(matches!(err, StrandError::Config(_)));
    assert!(err.to_string().contains("unknown agent 'summarize'"));
}

#[test]
fn test_missing_connector_fails_before_run() {
    let file = workflow_file(WORKFLOW);
    let config = WorkflowConfig::load(file.path()).unwrap();
    let registry = registry(&[
        ("fetch", Arc::new(MockUnit::new("fetch"))),
        ("summarize", Arc::new(MockUnit::new("summarize"))),
        ("lint", Arc::new(MockUnit::new("lint"))),
    ]);

    let err = Scheduler::from_config(&config, &registry, HashMap::new())
        .err()
        .expect("missing connector rejected");
    assert!(err.to_string().contains("No connector registered for capability 'repo'"));
}

#[test]
fn test_dangling_dependency_is_graph_error() {
    let file = workflow_file(
        r#"
[[nodes]]
id = "a"
agent = "x"
depends_on = ["ghost"]
"#,
    );
    let config = WorkflowConfig::load(file.path()).unwrap();
    let err = DependencyGraph::from_config(&config).unwrap_err();
    assert!(matches!(err, StrandError::Graph(_)));
}

#[test]
fn test_cyclic_workflow_is_graph_error() {
    let file = workflow_file(
        r#"
[[nodes]]
id = "a"
agent = "x"
depends_on = ["d"]

[[nodes]]
id = "d"
agent = "x"
depends_on = ["a"]
"#,
    );
    let config = WorkflowConfig::load(file.path()).unwrap();
    let unit = Arc::new(MockUnit::new("x"));
    let err = Scheduler::from_config(&config, &registry(&[("x", unit.clone())]), HashMap::new())
        .err()
        .expect("cycle rejected");
    assert!(matches!(err, StrandError::Graph(_)));
    assert_eq!(unit.initialize_calls(), 0);
}

#[test]
fn test_undeclared_capability_rejected() {
    let file = workflow_file(
        r#"
[[nodes]]
id = "a"
agent = "x"
capabilities = ["db"]
"#,
    );
    let err = WorkflowConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("undeclared capability 'db'"));
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("STRAND_TEST_AGENT", "echo");
    let file = workflow_file(
        r#"
[[nodes]]
id = "a"
agent = "${STRAND_TEST_AGENT}"
"#,
    );
    let config = WorkflowConfig::load(file.path()).unwrap();
    assert_eq!(config.nodes[0].agent, "echo");
}
