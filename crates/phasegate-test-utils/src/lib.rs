//! Shared fixtures for Phasegate tests: scripted executors, a ready-made
//! configuration, small DAGs, and an orchestrator harness on a temporary
//! ledger with a manual clock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use phasegate_core::clock::ManualClock;
use phasegate_core::config::AppConfig;
use phasegate_core::error::Result;
use phasegate_core::traits::Executor;
use phasegate_core::types::{ExecutorFailure, TaskContract, TaskResult};
use phasegate_engine::{
    CheckpointStore, DagDefinition, Edge, ExecutorRegistry, GateSpec, Orchestrator, PhaseNode,
};

/// Executor that plays back queued results, then repeats a fallback.
pub struct ScriptedExecutor {
    name: String,
    results: Mutex<VecDeque<TaskResult>>,
    fallback: TaskResult,
    delay: Option<Duration>,
    calls: AtomicU32,
    seen: Mutex<Vec<TaskContract>>,
}

impl ScriptedExecutor {
    /// Succeeds with a null output at no cost.
    pub fn succeeding(name: &str) -> Self {
        Self::with_fallback(name, TaskResult::success(serde_json::Value::Null, 0.0))
    }

    /// Fails every attempt with a retryable error.
    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_fallback(
            name,
            TaskResult::failure(ExecutorFailure::new("scripted", message), 0.0),
        )
    }

    pub fn with_fallback(name: &str, fallback: TaskResult) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue a result ahead of the fallback.
    pub fn then(self, result: TaskResult) -> Self {
        if let Ok(mut results) = self.results.lock() {
            results.push_back(result);
        }
        self
    }

    /// Sleep before answering each attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contracts received so far, in call order.
    pub fn contracts(&self) -> Vec<TaskContract> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: TaskContract) -> BoxFuture<'_, Result<TaskResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(task);
        }
        let next = self
            .results
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(next)
        })
    }
}

/// Configuration with a cost cap set and millisecond retry backoff.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.budget.run_cost_cap = Some(100.0);
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

/// `ingest -> review (gate) -> publish`, all automated nodes on `noop`.
pub fn linear_gate_definition(approvals: u32) -> DagDefinition {
    DagDefinition::new("linear-gate")
        .with_node(
            PhaseNode::new("ingest", "Ingest").with_params(serde_json::json!({"rows": 10, "cost": 1.0})),
        )
        .with_node(PhaseNode::gate("review", "Review", GateSpec::approvals(approvals)))
        .with_node(PhaseNode::new("publish", "Publish").with_params(serde_json::json!({"cost": 1.0})))
        .with_edge(Edge::always("ingest", "review"))
        .with_edge(Edge::always("review", "publish"))
}

/// Orchestrator on a temporary ledger, driven by a manual clock.
pub struct TestHarness {
    pub orchestrator: Arc<Orchestrator>,
    pub clock: Arc<ManualClock>,
    pub dir: tempfile::TempDir,
    config: AppConfig,
    executors: ExecutorRegistry,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with(test_config(), ExecutorRegistry::with_builtins())
    }

    pub fn with(config: AppConfig, executors: ExecutorRegistry) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Arc::new(build_orchestrator(&config, &executors, &clock, dir.path()));
        Self {
            orchestrator,
            clock,
            dir,
            config,
            executors,
        }
    }

    /// A second orchestrator on the same ledger, as after a process restart.
    /// The first orchestrator gives up its writer locks, as on exit.
    pub fn restart(&self) -> Orchestrator {
        self.orchestrator.store().release_all();
        build_orchestrator(&self.config, &self.executors, &self.clock, self.dir.path())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn build_orchestrator(
    config: &AppConfig,
    executors: &ExecutorRegistry,
    clock: &Arc<ManualClock>,
    dir: &Path,
) -> Orchestrator {
    let store = CheckpointStore::open(dir, clock.clone()).expect("open checkpoint store");
    Orchestrator::builder(Arc::new(config.clone()))
        .store(Arc::new(store))
        .executors(executors.clone())
        .clock(clock.clone())
        .build()
        .expect("build orchestrator")
}
