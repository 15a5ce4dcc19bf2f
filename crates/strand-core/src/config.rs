use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Top-level workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Human-readable workflow name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Maximum number of nodes running at once.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Wall-clock budget for the whole run. Unset = unlimited.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Default timeout for each execute attempt of a node.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Node-level retry defaults.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            timeout_secs: None,
            node_timeout_secs: default_node_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn global_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

fn default_max_parallelism() -> usize { 4 }
fn default_node_timeout() -> u64 { 300 }

/// Retry policy shared by node execution and connection establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }
fn default_jitter() -> bool { true }

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique node id within the workflow.
    pub id: String,
    /// Registered agent name implementing this node.
    pub agent: String,
    /// Required agent version. Unset accepts whatever is registered.
    #[serde(default)]
    pub version: Option<String>,
    /// Capabilities leased for the duration of each execute call.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Prerequisite node ids.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Failure only degrades dependents instead of skipping them.
    #[serde(default)]
    pub optional: bool,
    /// Overrides `run.retry.max_attempts`.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides `run.node_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Agent-specific settings, handed to the unit factory untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Pool, retry and breaker settings for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
    /// Maximum concurrent leases.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// How long a caller waits for a free lease.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Connections older than this are closed instead of reused.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            acquire_timeout_ms: default_acquire_timeout(),
            lease_ttl_secs: default_lease_ttl(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl CapabilityConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn default_pool_capacity() -> usize { 4 }
fn default_acquire_timeout() -> u64 { 30000 }
fn default_lease_ttl() -> u64 { 300 }

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial open period before a half-open probe is admitted.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    /// Ceiling for the doubled cool-down after failed probes.
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
            max_cooldown_ms: default_max_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown() -> u64 { 30000 }
fn default_max_cooldown() -> u64 { 300000 }

impl WorkflowConfig {
    /// Load a workflow from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a workflow from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: WorkflowConfig =
            toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option bounds. Graph shape (duplicates, dangling references,
    /// cycles) is checked when the graph is built.
    pub fn validate(&self) -> Result<()> {
        if self.run.max_parallelism == 0 {
            return Err(StrandError::Config(
                "run.max_parallelism must be at least 1".into(),
            ));
        }
        if self.run.node_timeout_secs == 0 {
            return Err(StrandError::Config(
                "run.node_timeout_secs must be at least 1".into(),
            ));
        }
        validate_retry("run.retry", &self.run.retry)?;

        for (name, cap) in &self.capabilities {
            if cap.pool_capacity == 0 {
                return Err(StrandError::Config(format!(
                    "capabilities.{}.pool_capacity must be at least 1",
                    name
                )));
            }
            validate_retry(&format!("capabilities.{}.retry", name), &cap.retry)?;
            if cap.breaker.failure_threshold == 0 {
                return Err(StrandError::Config(format!(
                    "capabilities.{}.breaker.failure_threshold must be at least 1",
                    name
                )));
            }
            if cap.breaker.cooldown_ms > cap.breaker.max_cooldown_ms {
                return Err(StrandError::Config(format!(
                    "capabilities.{}.breaker.cooldown_ms exceeds max_cooldown_ms",
                    name
                )));
            }
        }

        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(StrandError::Config("node id must not be empty".into()));
            }
            if node.agent.trim().is_empty() {
                return Err(StrandError::Config(format!(
                    "node '{}' has no agent",
                    node.id
                )));
            }
            if node.max_attempts == Some(0) {
                return Err(StrandError::Config(format!(
                    "node '{}': max_attempts must be at least 1",
                    node.id
                )));
            }
            if node.timeout_secs == Some(0) {
                return Err(StrandError::Config(format!(
                    "node '{}': timeout_secs must be at least 1",
                    node.id
                )));
            }
            for cap in &node.capabilities {
                if !self.capabilities.contains_key(cap) {
                    return Err(StrandError::Config(format!(
                        "node '{}' requires undeclared capability '{}'",
                        node.id, cap
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_retry(path: &str, retry: &RetryConfig) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(StrandError::Config(format!(
            "{}.max_attempts must be at least 1",
            path
        )));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        return Err(StrandError::Config(format!(
            "{}.initial_backoff_ms exceeds max_backoff_ms",
            path
        )));
    }
    Ok(())
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
