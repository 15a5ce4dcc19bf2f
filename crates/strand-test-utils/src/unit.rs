use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

use strand_core::error::UnitError;
use strand_core::types::{NodeInput, OutputMap};
use strand_engine::{ExecutionUnit, UnitContext};

/// One scripted `execute` call.
#[derive(Debug, Clone)]
pub struct Step {
    pub delay: Duration,
    pub result: Result<OutputMap, UnitError>,
}

impl Step {
    pub fn ok(outputs: OutputMap) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(outputs),
        }
    }

    pub fn fail(error: UnitError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What a `MockUnit` observed during one `execute` call.
#[derive(Debug, Clone)]
pub struct Execution {
    pub node_id: String,
    pub attempt: u32,
    pub input: NodeInput,
    pub capabilities: Vec<String>,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Scripted execution unit.
///
/// Each `execute` pops the next [`Step`]; once the script runs out every call
/// returns the fallback output after the fallback delay. Every lifecycle
/// call is counted, and delays honour the unit's cancellation token.
pub struct MockUnit {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: OutputMap,
    fallback_delay: Duration,
    init_error: Option<UnitError>,
    initializes: AtomicUsize,
    executes: AtomicUsize,
    cleanups: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    executions: Mutex<Vec<Execution>>,
}

impl MockUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: OutputMap::new(),
            fallback_delay: Duration::ZERO,
            init_error: None,
            initializes: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Always succeed with `{ key: value }`.
    pub fn returning(name: impl Into<String>, key: &str, value: serde_json::Value) -> Self {
        let mut unit = Self::new(name);
        unit.fallback.insert(key.to_string(), value);
        unit
    }

    /// Queue scripted steps ahead of the fallback.
    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Fail transiently `n` times before falling back to success.
    pub fn failing_transiently(self, n: usize) -> Self {
        self.with_steps(
            (0..n).map(|i| Step::fail(UnitError::transient(format!("flake #{}", i + 1)))),
        )
    }

    /// Delay applied to every fallback call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fallback_delay = delay;
        self
    }

    pub fn with_init_error(mut self, error: UnitError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn initialize_calls(&self) -> usize {
        self.initializes.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Most concurrent `execute` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().clone()
    }

    /// Start and end of every finished execution.
    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.executions
            .lock()
            .iter()
            .filter_map(|e| e.finished.map(|f| (e.started, f)))
            .collect()
    }

    fn next_step(&self) -> Step {
        self.script.lock().pop_front().unwrap_or_else(|| Step {
            delay: self.fallback_delay,
            result: Ok(self.fallback.clone()),
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionUnit for MockUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), UnitError>> {
        Box::pin(async move {
            self.initializes.fetch_add(1, Ordering::SeqCst);
            match &self.init_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        })
    }

    fn execute<'a>(&'a self, ctx: UnitContext<'a>) -> BoxFuture<'a, Result<OutputMap, UnitError>> {
        Box::pin(async move {
            self.executes.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            // Also decrements when the engine drops this future mid-flight
            let _in_flight = InFlight(&self.in_flight);

            let slot = {
                let mut executions = self.executions.lock();
                executions.push(Execution {
                    node_id: ctx.node_id.to_string(),
                    attempt: ctx.attempt,
                    input: ctx.input.clone(),
                    capabilities: ctx.leases.iter().map(|l| l.capability().to_string()).collect(),
                    started: Instant::now(),
                    finished: None,
                });
                executions.len() - 1
            };

            let step = self.next_step();
            let finished = tokio::select! {
                _ = tokio::time::sleep(step.delay) => true,
                _ = ctx.cancel.cancelled() => false,
            };

            if !finished {
                return Err(UnitError::permanent("cancelled"));
            }
            self.executions.lock()[slot].finished = Some(Instant::now());
            step.result
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        })
    }
}
