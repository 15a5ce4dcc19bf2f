use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use strand_core::config::RetryConfig;
use strand_engine::{AgentDescriptor, RunSettings};

/// `a -> b -> c ...`, one agent per node named after the node.
pub fn chain(ids: &[&str]) -> Vec<AgentDescriptor> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let node = AgentDescriptor::new(*id, *id);
            if i == 0 {
                node
            } else {
                node.depends_on([ids[i - 1]])
            }
        })
        .collect()
}

/// `a -> {b, c} -> d`.
pub fn diamond() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("a", "a"),
        AgentDescriptor::new("b", "b").depends_on(["a"]),
        AgentDescriptor::new("c", "c").depends_on(["a"]),
        AgentDescriptor::new("d", "d").depends_on(["b", "c"]),
    ]
}

/// `d -> a -> d`.
pub fn cycle() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("a", "a").depends_on(["d"]),
        AgentDescriptor::new("d", "d").depends_on(["a"]),
    ]
}

/// Retries with millisecond backoff and no jitter.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        jitter: false,
    }
}

pub fn settings(max_parallelism: usize) -> RunSettings {
    RunSettings {
        max_parallelism,
        global_timeout: None,
        node_timeout: Duration::from_secs(30),
        retry: fast_retry(3),
    }
}

/// Write a workflow definition to a temporary `.toml` file.
pub fn workflow_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp workflow");
    file.write_all(contents.as_bytes()).expect("write temp workflow");
    file
}
