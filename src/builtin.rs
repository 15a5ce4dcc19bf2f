//! Demo agents and loopback connectors so workflow files can be run
//! without any external services.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use strand_core::config::WorkflowConfig;
use strand_core::error::{ConnectError, ErrorKind, UnitError};
use strand_core::traits::{Connection, Connector};
use strand_core::types::OutputMap;
use strand_engine::{AgentDescriptor, ExecutionUnit, UnitContext, UnitRegistry};

pub const BUILTIN_VERSION: &str = "1.0";

/// Registry with `echo`, `delay` and `fail`.
pub fn registry() -> UnitRegistry {
    let mut registry = UnitRegistry::new();
    registry.register("echo", BUILTIN_VERSION, |node| {
        Ok(Arc::new(EchoUnit::from_descriptor(node)) as Arc<dyn ExecutionUnit>)
    });
    registry.register("delay", BUILTIN_VERSION, |node| {
        Ok(Arc::new(DelayUnit::from_descriptor(node)?) as Arc<dyn ExecutionUnit>)
    });
    registry.register("fail", BUILTIN_VERSION, |node| {
        Ok(Arc::new(FailUnit::from_descriptor(node)?) as Arc<dyn ExecutionUnit>)
    });
    registry
}

/// A loopback connector for every declared capability.
pub fn loopback_connectors(config: &WorkflowConfig) -> HashMap<String, Arc<dyn Connector>> {
    config
        .capabilities
        .keys()
        .map(|name| {
            let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector {
                capability: name.clone(),
                next_id: AtomicU32::new(0),
            });
            (name.clone(), connector)
        })
        .collect()
}

/// Emits `config.message` (or the node id) plus what it received.
struct EchoUnit {
    message: String,
}

impl EchoUnit {
    fn from_descriptor(node: &AgentDescriptor) -> Self {
        let message = node
            .config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(&node.id)
            .to_string();
        Self { message }
    }
}

impl ExecutionUnit for EchoUnit {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute<'a>(&'a self, ctx: UnitContext<'a>) -> BoxFuture<'a, Result<OutputMap, UnitError>> {
        Box::pin(async move {
            let mut out = OutputMap::new();
            out.insert("message".into(), json!(self.message));
            out.insert("inputs".into(), json!(ctx.input.flatten()));
            let degraded: Vec<&str> = ctx.input.degraded().collect();
            if !degraded.is_empty() {
                out.insert("degraded".into(), json!(degraded));
            }
            let leased: Vec<String> = ctx
                .leases
                .iter()
                .filter_map(|l| l.downcast::<LoopbackConnection>())
                .map(|c| c.label())
                .collect();
            if !leased.is_empty() {
                out.insert("connections".into(), json!(leased));
            }
            Ok(out)
        })
    }
}

/// Sleeps for `config.ms` milliseconds.
struct DelayUnit {
    delay: Duration,
}

impl DelayUnit {
    fn from_descriptor(node: &AgentDescriptor) -> Result<Self, UnitError> {
        let ms = match node.config.get("ms") {
            None => 100,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| UnitError::permanent("delay: 'ms' must be a non-negative integer"))?,
        };
        Ok(Self {
            delay: Duration::from_millis(ms),
        })
    }
}

impl ExecutionUnit for DelayUnit {
    fn name(&self) -> &str {
        "delay"
    }

    fn execute<'a>(&'a self, ctx: UnitContext<'a>) -> BoxFuture<'a, Result<OutputMap, UnitError>> {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => return Err(UnitError::permanent("interrupted")),
            }
            let mut out = OutputMap::new();
            out.insert("slept_ms".into(), json!(self.delay.as_millis() as u64));
            Ok(out)
        })
    }
}

/// Fails `config.times` times (forever if unset) with `config.kind`, then
/// succeeds.
struct FailUnit {
    kind: ErrorKind,
    times: Option<u32>,
    calls: AtomicU32,
}

impl FailUnit {
    fn from_descriptor(node: &AgentDescriptor) -> Result<Self, UnitError> {
        let kind = match node.config.get("kind").and_then(|v| v.as_str()) {
            None | Some("permanent") => ErrorKind::Permanent,
            Some("transient") => ErrorKind::Transient,
            Some("fatal") => ErrorKind::Fatal,
            Some(other) => {
                return Err(UnitError::permanent(format!("fail: unknown kind '{}'", other)))
            }
        };
        let times = node
            .config
            .get("times")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32);
        Ok(Self {
            kind,
            times,
            calls: AtomicU32::new(0),
        })
    }
}

impl ExecutionUnit for FailUnit {
    fn name(&self) -> &str {
        "fail"
    }

    fn execute<'a>(&'a self, ctx: UnitContext<'a>) -> BoxFuture<'a, Result<OutputMap, UnitError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.times.map_or(true, |n| call <= n) {
                return Err(UnitError::new(
                    self.kind,
                    format!("{} failed on attempt {}", ctx.node_id, ctx.attempt),
                ));
            }
            let mut out = OutputMap::new();
            out.insert("recovered_after".into(), json!(call - 1));
            Ok(out)
        })
    }
}

/// In-process stand-in for a real capability.
pub struct LoopbackConnection {
    capability: String,
    id: u32,
}

impl LoopbackConnection {
    pub fn label(&self) -> String {
        format!("{}#{}", self.capability, self.id)
    }
}

impl Connection for LoopbackConnection {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct LoopbackConnector {
    capability: String,
    next_id: AtomicU32,
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, ConnectError>> {
        Box::pin(async move {
            let conn: Arc<dyn Connection> = Arc::new(LoopbackConnection {
                capability: self.capability.clone(),
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
            });
            Ok(conn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_agents_registered() {
        let registry = registry();
        assert_eq!(registry.list(), vec!["delay", "echo", "fail"]);
        assert_eq!(registry.version("echo"), Some(BUILTIN_VERSION));
    }

    #[test]
    fn test_bad_builtin_config_rejected() {
        let registry = registry();
        let node = AgentDescriptor::new("f", "fail").with_config(json!({"kind": "weird"}));
        assert!(registry.instantiate(&node).is_err());

        let node = AgentDescriptor::new("d", "delay").with_config(json!({"ms": "soon"}));
        assert!(registry.instantiate(&node).is_err());
    }

    #[test]
    fn test_loopback_per_capability() {
        let config = WorkflowConfig::from_toml_str(
            r#"
[capabilities.db]
[capabilities.search]
"#,
        )
        .unwrap();
        let connectors = loopback_connectors(&config);
        assert_eq!(connectors.len(), 2);
        assert!(connectors.contains_key("db"));
    }
}
