use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use phasegate_core::clock::{self, Clock, SystemClock};
use phasegate_core::config::AppConfig;
use phasegate_core::error::{PhasegateError, Result};
use phasegate_core::event::EventBus;
use phasegate_core::gate::{
    GateInstance, GateReason, GateResolution, GateStatus, QuorumSpec, Vote, VoteDecision,
};
use phasegate_core::metrics::Metrics;
use phasegate_core::types::{
    ExecutionStatus, ExecutorFailure, GateId, NodeExecution, RunEvent, RunId, RunStatus,
    TaskContract, TaskOutcome,
};

use crate::audit::{AuditEvent, AuditKind, AuditReader};
use crate::budget::{BudgetBreach, BudgetGuard, BudgetScope, BudgetSnapshot};
use crate::checkpoint::CheckpointStore;
use crate::executors::ExecutorRegistry;
use crate::gate::{GateRequest, GateSubsystem};
use crate::graph::{DagDefinition, Edge, EdgeKind, PhaseNode, RunContext};
use crate::pool::{Completion, CompletionOutcome, Dispatch, WorkerPool};
use crate::retry::{calculate_backoff, should_retry};
use crate::state::{BreachHold, NodeProgress, NodeState, Reproducibility, RunSnapshot};

/// Live coordination state of one loaded run.
struct RunHandle {
    definition: Arc<DagDefinition>,
    /// Node ids in topological order over forward edges.
    order: Vec<String>,
    state: Mutex<RunSnapshot>,
    kill: CancellationToken,
    /// Child of `kill`, also cancelled once the run finishes on its own.
    stop: CancellationToken,
    pool: WorkerPool,
    /// Held by whichever caller is driving the run.
    completions: Mutex<mpsc::UnboundedReceiver<Completion>>,
}

/// Audit entries and events produced by one state transition. Audit entries
/// are appended after the transition's checkpoint; events are published
/// after both.
#[derive(Default)]
struct Transition {
    audit: Vec<AuditEvent>,
    events: Vec<RunEvent>,
}

impl Transition {
    fn audit(&mut self, event: AuditEvent) {
        self.audit.push(event);
    }

    fn emit(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    fn is_empty(&self) -> bool {
        self.audit.is_empty() && self.events.is_empty()
    }
}

/// Per-node summary in a [`RunView`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub state: NodeState,
    pub attempts: u32,
}

/// Read-only summary of a run for the CLI and the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: RunId,
    pub definition_id: String,
    pub status: RunStatus,
    pub operator_paused: bool,
    pub failure: Option<String>,
    pub nodes: Vec<NodeView>,
    pub open_gates: Vec<GateInstance>,
    pub budget: BudgetSnapshot,
    pub remaining_budget: f64,
    pub executions: usize,
    pub reproducibility: Reproducibility,
    pub checkpoint_seq: u64,
    pub head_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Builder for [`Orchestrator`]. Unset collaborators get production defaults.
pub struct OrchestratorBuilder {
    config: Arc<AppConfig>,
    store: Option<Arc<CheckpointStore>>,
    executors: Option<ExecutorRegistry>,
    clock: Option<Arc<dyn Clock>>,
    event_bus: Option<Arc<EventBus>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrchestratorBuilder {
    pub fn store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new()?),
        };
        let event_bus = self.event_bus.unwrap_or_default();
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(
                CheckpointStore::open(&self.config.store_dir(), clock.clone())?
                    .with_metrics(metrics.clone()),
            ),
        };
        let gates = Arc::new(GateSubsystem::new(
            self.config.hrg.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let budget = Arc::new(BudgetGuard::new(&self.config.budget));

        Ok(Orchestrator {
            config: self.config,
            store,
            gates,
            budget,
            executors: self.executors.unwrap_or_else(ExecutorRegistry::with_builtins),
            clock,
            event_bus,
            metrics,
            runs: RwLock::new(HashMap::new()),
        })
    }
}

/// Drives runs of phase-gated DAGs.
///
/// Each run has one coordinator: the caller of [`Orchestrator::advance`]
/// holds the run's completion channel, and every state transition happens
/// under the run's state lock. Transitions are checkpointed before their
/// audit entries and events become visible.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    store: Arc<CheckpointStore>,
    gates: Arc<GateSubsystem>,
    budget: Arc<BudgetGuard>,
    executors: ExecutorRegistry,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl Orchestrator {
    pub fn builder(config: Arc<AppConfig>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            executors: None,
            clock: None,
            event_bus: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn gates(&self) -> &Arc<GateSubsystem> {
        &self.gates
    }

    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn audit_reader(&self) -> AuditReader {
        AuditReader::new(self.store.clone())
    }

    fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .cloned()
            .ok_or_else(|| PhasegateError::RunNotFound(run_id.to_string()))
    }

    fn handles(&self) -> Vec<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn is_loaded(&self, run_id: &RunId) -> bool {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(run_id)
    }

    /// Runs in memory and in the store, sorted.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut runs = self.store.list_runs()?;
        for id in self.runs.read().unwrap_or_else(|p| p.into_inner()).keys() {
            if !runs.contains(id) {
                runs.push(id.clone());
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Start a run with a fresh id.
    pub async fn start_run(
        &self,
        definition: DagDefinition,
        input: serde_json::Value,
    ) -> Result<RunId> {
        self.start_run_with_id(RunId::new(), definition, input).await
    }

    /// Validate the definition, persist it, and checkpoint the initial state.
    /// Nothing is dispatched until [`Orchestrator::advance`].
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        definition: DagDefinition,
        input: serde_json::Value,
    ) -> Result<RunId> {
        definition.validate()?;
        for node in definition.nodes.iter().filter(|n| !n.is_gate()) {
            if !self.executors.contains(&node.executor) {
                return Err(PhasegateError::ExecutorNotFound(format!(
                    "{} (node '{}')",
                    node.executor, node.id
                )));
            }
        }
        if self.is_loaded(&run_id) || self.store.checkpoints_path(&run_id)?.exists() {
            return Err(PhasegateError::Store(format!("run {} already exists", run_id)));
        }
        let cap = self.config.budget.run_cost_cap.ok_or_else(|| {
            PhasegateError::Config("budget.run_cost_cap must be set before starting a run".into())
        })?;

        let order = definition.topological_order()?;
        let now = self.clock.now();
        self.store.put_definition(&run_id, &definition)?;
        self.budget.open_run(&run_id, cap);

        let entries: Vec<String> = definition
            .entry_nodes()
            .into_iter()
            .map(String::from)
            .collect();
        let nodes: BTreeMap<String, NodeProgress> = definition
            .nodes
            .iter()
            .map(|n| {
                let mut progress = NodeProgress::waiting();
                if entries.contains(&n.id) {
                    progress.state = NodeState::Ready;
                }
                (n.id.clone(), progress)
            })
            .collect();

        let orchestration = &self.config.orchestration;
        let reproducibility = Reproducibility {
            seed: orchestration.seed,
            pinned_models: orchestration
                .pinned_models
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            model: Some(orchestration.model.clone()),
            definition_hash: definition.content_hash(),
        };

        let mut snapshot = RunSnapshot {
            run_id: run_id.clone(),
            definition_id: definition.id.clone(),
            status: RunStatus::Running,
            operator_paused: false,
            nodes,
            executions: vec![],
            context: RunContext::from_json(input),
            gates: vec![],
            loop_counts: BTreeMap::new(),
            budget: BudgetSnapshot {
                cap,
                consumed: 0.0,
                reserved: 0.0,
                time_cap_secs: self.config.budget.run_time_cap_secs,
            },
            breach: None,
            failure: None,
            reproducibility,
            created_at: now,
            updated_at: now,
        };

        let mut tx = Transition::default();
        tx.audit(AuditEvent::new(&run_id, AuditKind::RunStarted).with_detail(json!({
            "definition_id": definition.id,
            "definition_hash": snapshot.reproducibility.definition_hash,
            "nodes": definition.nodes.len(),
            "cost_cap": cap,
            "seed": snapshot.reproducibility.seed,
            "model": snapshot.reproducibility.model,
        })));
        tx.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
        });
        self.commit(&mut snapshot, tx)?;

        info!(
            run_id = %run_id,
            definition = %definition.id,
            nodes = definition.nodes.len(),
            cost_cap = cap,
            "Run started"
        );
        self.insert_handle(definition, order, snapshot);
        Ok(run_id)
    }

    fn insert_handle(&self, definition: DagDefinition, order: Vec<String>, snapshot: RunSnapshot) {
        let kill = CancellationToken::new();
        let stop = kill.child_token();
        let (pool, completions) = WorkerPool::new(
            self.config.effective_concurrency(),
            stop.clone(),
            self.metrics.clone(),
        );
        let run_id = snapshot.run_id.clone();
        let handle = Arc::new(RunHandle {
            definition: Arc::new(definition),
            order,
            state: Mutex::new(snapshot),
            kill,
            stop,
            pool,
            completions: Mutex::new(completions),
        });
        self.runs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id, handle);
    }

    /// Drive a run until nothing is in flight: dispatch every ready node,
    /// apply completions as they arrive, repeat. Returns the run status at
    /// that point. Returns as soon as the kill-switch fires.
    pub async fn advance(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        let mut completions = handle.completions.lock().await;

        loop {
            {
                let mut st = handle.state.lock().await;
                while let Ok(completion) = completions.try_recv() {
                    self.apply_completion(&handle, &mut st, completion)?;
                }
                if handle.kill.is_cancelled() {
                    self.finalize_kill(&mut st)?;
                    return Ok(st.status);
                }
                if st.status.is_terminal() {
                    handle.stop.cancel();
                    return Ok(st.status);
                }

                self.step(&handle, &mut st)?;
                if st.status.is_terminal() {
                    handle.stop.cancel();
                }
                if st.status.is_terminal() || st.in_flight() == 0 {
                    debug!(run_id = %run_id, status = %st.status, "Run settled");
                    return Ok(st.status);
                }
            }

            tokio::select! {
                biased;
                _ = handle.kill.cancelled() => {
                    let mut st = handle.state.lock().await;
                    self.finalize_kill(&mut st)?;
                    return Ok(st.status);
                }
                completion = completions.recv() => {
                    let Some(completion) = completion else {
                        return Err(PhasegateError::Store(format!(
                            "completion channel closed for run {}",
                            run_id
                        )));
                    };
                    let mut st = handle.state.lock().await;
                    self.apply_completion(&handle, &mut st, completion)?;
                }
            }
        }
    }

    /// Settle readiness and dispatch until the run stops changing.
    fn step(&self, handle: &RunHandle, st: &mut RunSnapshot) -> Result<()> {
        loop {
            let mut tx = Transition::default();
            let propagated = self.propagate(handle, st, &mut tx);
            let (dispatched, spawns) = self.dispatch_ready(handle, st, &mut tx)?;
            self.refresh_status(st, &mut tx);
            if !tx.is_empty() {
                self.commit(st, tx)?;
            }
            for dispatch in spawns {
                handle.pool.spawn(dispatch);
            }
            if !propagated && !dispatched {
                return Ok(());
            }
        }
    }

    /// Move waiting nodes to ready or skipped once their inputs settle.
    /// Edges whose source was skipped do not count either way.
    fn propagate(&self, handle: &RunHandle, st: &mut RunSnapshot, tx: &mut Transition) -> bool {
        if st.status.is_terminal() {
            return false;
        }
        let mut changed = false;
        for id in &handle.order {
            if st.nodes.get(id).map(|p| &p.state) != Some(&NodeState::Waiting) {
                continue;
            }
            let mut unsettled = false;
            let mut satisfied = 0;
            let mut unsatisfied = 0;
            for edge in handle.definition.incoming_forward(id) {
                let source = st.nodes.get(&edge.from).map(|p| &p.state);
                let succeeded = match source {
                    Some(NodeState::Succeeded) => true,
                    Some(NodeState::Failed) => false,
                    Some(NodeState::Skipped) => continue,
                    _ => {
                        unsettled = true;
                        break;
                    }
                };
                if edge.fires(succeeded, st.context.data()) {
                    satisfied += 1;
                } else {
                    unsatisfied += 1;
                }
            }
            if unsettled {
                continue;
            }

            let next = if satisfied > 0 && unsatisfied == 0 {
                NodeState::Ready
            } else {
                NodeState::Skipped
            };
            if next == NodeState::Skipped {
                debug!(run_id = %st.run_id, node_id = %id, "Node skipped");
                tx.audit(AuditEvent::new(&st.run_id, AuditKind::NodeSkipped).for_node(id.as_str()));
            }
            if let Some(progress) = st.nodes.get_mut(id) {
                progress.state = next;
            }
            changed = true;
        }
        changed
    }

    /// Dispatch ready automated nodes and open gates on ready gate nodes.
    fn dispatch_ready(
        &self,
        handle: &RunHandle,
        st: &mut RunSnapshot,
        tx: &mut Transition,
    ) -> Result<(bool, Vec<Dispatch>)> {
        let mut spawns = Vec::new();
        if st.status.is_terminal() || st.operator_paused || handle.kill.is_cancelled() {
            return Ok((false, spawns));
        }

        let now = self.clock.now();
        if st.breach.is_none() {
            if let Err(breach) = self.budget.check_time(&st.run_id, st.created_at, now) {
                self.open_breach(st, breach, None, tx);
                return Ok((true, spawns));
            }
        }
        if st.breach.is_some() {
            return Ok((false, spawns));
        }

        let mut progressed = false;
        for id in &handle.order {
            if st.nodes.get(id).map(|p| &p.state) != Some(&NodeState::Ready) {
                continue;
            }
            let Some(node) = handle.definition.node(id) else {
                continue;
            };

            if node.is_gate() {
                self.open_node_gate(&handle.definition, st, node, 1, None, tx)?;
                progressed = true;
                continue;
            }

            if !self.budget.reserve(&st.run_id, node.estimated_cost) {
                let breach = self
                    .budget
                    .would_breach(&st.run_id, node.estimated_cost)
                    .unwrap_or(BudgetBreach {
                        scope: BudgetScope::Run,
                        consumed: st.budget.consumed + node.estimated_cost,
                        cap: st.budget.cap,
                    });
                self.open_breach(st, breach, Some(id.as_str()), tx);
                progressed = true;
                break;
            }

            let executor = match self.executors.get(&node.executor) {
                Ok(executor) => executor,
                Err(e) => {
                    self.budget.release(&st.run_id, node.estimated_cost);
                    return Err(e);
                }
            };
            let Some(progress) = st.nodes.get_mut(id) else {
                continue;
            };
            progress.attempts += 1;
            progress.entry_attempts += 1;
            progress.state = NodeState::Running;
            progress.reserved = node.estimated_cost;
            let delay = progress
                .not_before
                .take()
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or_default();
            let attempt = progress.attempts;

            let timeout_secs = node
                .timeout_secs
                .unwrap_or(self.config.orchestration.default_timeout_secs);
            let contract = TaskContract {
                run_id: st.run_id.clone(),
                node_id: id.clone(),
                attempt,
                context: st.context.data().clone(),
                params: node.params.clone(),
                capabilities: node.capabilities.clone(),
                deadline: now
                    + Duration::from_std(delay).unwrap_or_default()
                    + clock::seconds(timeout_secs),
            };

            st.executions
                .push(NodeExecution::dispatched(st.run_id.clone(), id.as_str(), attempt, now));
            info!(
                run_id = %st.run_id,
                node_id = %id,
                attempt,
                executor = %node.executor,
                delay_ms = delay.as_millis() as u64,
                "Dispatching node"
            );
            tx.audit(
                AuditEvent::new(&st.run_id, AuditKind::NodeDispatched)
                    .for_attempt(id.as_str(), attempt)
                    .with_detail(json!({
                        "executor": node.executor,
                        "reserved": node.estimated_cost,
                        "timeout_secs": timeout_secs,
                        "delay_ms": delay.as_millis() as u64,
                    })),
            );
            tx.emit(RunEvent::NodeDispatched {
                run_id: st.run_id.clone(),
                node_id: id.clone(),
                attempt,
            });
            spawns.push(Dispatch {
                executor,
                contract,
                timeout: StdDuration::from_secs(timeout_secs),
                delay,
            });
            progressed = true;
        }
        Ok((progressed, spawns))
    }

    /// Open a review gate on a gate node and block the node on it.
    fn open_node_gate(
        &self,
        definition: &DagDefinition,
        st: &mut RunSnapshot,
        node: &PhaseNode,
        severity: u8,
        rearmed_from: Option<GateId>,
        tx: &mut Transition,
    ) -> Result<GateId> {
        let hrg = &self.config.hrg;
        let spec = node.gate.clone().unwrap_or_default();
        let sla_secs = spec.sla_secs.unwrap_or(hrg.default_sla_secs);
        let action = spec.default_action.unwrap_or(hrg.default_action);
        let mut request = GateRequest::new(
            &st.run_id,
            node.id.as_str(),
            spec.quorum(&hrg.rejection),
            self.clock.now() + clock::seconds(sla_secs),
            action,
        );
        request.severity = severity;
        request.escalated_from = rearmed_from.clone();
        let min_approvals = request.quorum.min_approvals;
        let deadline = request.sla_deadline;

        let mut gate = self.gates.open(request, &mut tx.events);
        let gate_id = gate.gate_id.clone();
        if let Some(progress) = st.nodes.get_mut(&node.id) {
            progress.state = NodeState::Blocked {
                gate_id: gate_id.clone(),
            };
        }
        tx.audit(
            AuditEvent::new(&st.run_id, AuditKind::GateCreated)
                .for_node(node.id.as_str())
                .with_detail(json!({
                    "gate_id": gate_id,
                    "min_approvals": min_approvals,
                    "sla_deadline": deadline.to_rfc3339(),
                    "default_action": action,
                    "severity": severity,
                    "rearmed_from": rearmed_from,
                })),
        );

        if hrg.enabled {
            st.upsert_gate(gate);
        } else {
            self.gates.bypass(&mut gate, &mut tx.events);
            tx.audit(
                AuditEvent::new(&st.run_id, AuditKind::GateBypassed)
                    .for_node(node.id.as_str())
                    .with_detail(json!({ "gate_id": gate_id })),
            );
            st.upsert_gate(gate.clone());
            self.apply_gate_outcome(definition, st, &gate, None, tx);
        }
        Ok(gate_id)
    }

    /// Hold the run on a budget or TTL gate.
    fn open_breach(
        &self,
        st: &mut RunSnapshot,
        breach: BudgetBreach,
        node_id: Option<&str>,
        tx: &mut Transition,
    ) {
        let hrg = &self.config.hrg;
        let reason = match breach.scope {
            BudgetScope::RunTime => GateReason::TtlBreach,
            BudgetScope::Run | BudgetScope::Global => GateReason::BudgetBreach,
        };
        let quorum = QuorumSpec {
            rejection: hrg.rejection.clone(),
            ..QuorumSpec::approvals(1)
        };
        let request = GateRequest::new(
            &st.run_id,
            format!("budget:{}", breach.scope),
            quorum,
            self.clock.now() + clock::seconds(hrg.default_sla_secs),
            self.config.budget.breach_action,
        )
        .with_reason(reason);
        let gate = self.gates.open(request, &mut tx.events);
        let gate_id = gate.gate_id.clone();
        st.upsert_gate(gate);

        warn!(
            run_id = %st.run_id,
            scope = %breach.scope,
            consumed = breach.consumed,
            cap = breach.cap,
            gate_id = %gate_id,
            "Budget breach, holding run for review"
        );
        let mut event = AuditEvent::new(&st.run_id, AuditKind::BudgetBreach).with_detail(json!({
            "scope": breach.scope,
            "consumed": breach.consumed,
            "cap": breach.cap,
            "gate_id": gate_id,
        }));
        if let Some(node_id) = node_id {
            event = event.for_node(node_id);
        }
        tx.audit(event);
        tx.emit(RunEvent::BudgetBreach {
            run_id: st.run_id.clone(),
            scope: breach.scope.to_string(),
            consumed: breach.consumed,
            cap: breach.cap,
        });
        st.breach = Some(BreachHold {
            gate_id,
            scope: breach.scope,
            node_id: node_id.map(String::from),
        });
    }

    /// Apply one worker report to the run.
    fn apply_completion(
        &self,
        handle: &RunHandle,
        st: &mut RunSnapshot,
        completion: Completion,
    ) -> Result<()> {
        let Completion {
            node_id,
            attempt,
            outcome,
            elapsed_ms,
        } = completion;

        let current = st
            .nodes
            .get(&node_id)
            .map(|p| p.state == NodeState::Running && p.attempts == attempt)
            .unwrap_or(false);
        if !current || st.status.is_terminal() || matches!(outcome, CompletionOutcome::Killed) {
            debug!(run_id = %st.run_id, node_id = %node_id, attempt, "Ignoring stale completion");
            return Ok(());
        }

        let now = self.clock.now();
        let (status, output, cost, failure) = match outcome {
            CompletionOutcome::Finished(result) => match result.status {
                TaskOutcome::Succeeded => {
                    (ExecutionStatus::Succeeded, Some(result.output), result.cost, None)
                }
                TaskOutcome::Failed => {
                    let failure = result.error.unwrap_or_else(|| {
                        ExecutorFailure::new("failed", "executor reported failure without detail")
                    });
                    (ExecutionStatus::Failed, None, result.cost, Some(failure))
                }
            },
            CompletionOutcome::Errored(message) => (
                ExecutionStatus::Failed,
                None,
                0.0,
                Some(ExecutorFailure::new("executor_error", message)),
            ),
            CompletionOutcome::TimedOut { timeout_secs } => (
                ExecutionStatus::TimedOut,
                None,
                0.0,
                Some(ExecutorFailure::timeout(timeout_secs)),
            ),
            CompletionOutcome::Killed => return Ok(()),
        };

        if let Some(exec) = st
            .executions
            .iter_mut()
            .rev()
            .find(|e| e.node_id == node_id && e.attempt == attempt)
        {
            exec.close(status, now, output.clone(), cost, failure.clone());
        }
        self.metrics.record_step_latency(&node_id, elapsed_ms);
        self.metrics.record_cost(cost);

        let reserved = st.nodes.get(&node_id).map(|p| p.reserved).unwrap_or_default();
        let breach = self.budget.commit(&st.run_id, reserved, cost).err();
        if let Some(progress) = st.nodes.get_mut(&node_id) {
            progress.reserved = 0.0;
        }

        info!(
            run_id = %st.run_id,
            node_id = %node_id,
            attempt,
            status = ?status,
            cost,
            elapsed_ms,
            "Node attempt closed"
        );
        let mut tx = Transition::default();
        tx.audit(
            AuditEvent::new(&st.run_id, AuditKind::NodeCompleted)
                .for_attempt(node_id.as_str(), attempt)
                .with_detail(json!({
                    "status": status,
                    "cost": cost,
                    "elapsed_ms": elapsed_ms,
                    "error": failure,
                })),
        );
        tx.emit(RunEvent::NodeCompleted {
            run_id: st.run_id.clone(),
            node_id: node_id.clone(),
            attempt,
            status,
            elapsed_ms,
        });

        match failure {
            None => {
                let output_keys = handle
                    .definition
                    .node(&node_id)
                    .map(|n| n.output_keys.clone())
                    .unwrap_or_default();
                st.context.ingest_output(
                    &node_id,
                    &output_keys,
                    &output.unwrap_or(serde_json::Value::Null),
                );
                st.context.set_str(format!("{}_status", node_id), "success");
                if let Some(progress) = st.nodes.get_mut(&node_id) {
                    progress.state = NodeState::Succeeded;
                }
                self.follow_retry_edges(&handle.definition, st, &node_id, true, &mut tx);
            }
            Some(failure) => {
                self.on_attempt_failed(&handle.definition, st, &node_id, attempt, failure, now, &mut tx);
            }
        }

        if let Some(breach) = breach {
            if st.breach.is_none() && st.failure.is_none() {
                self.open_breach(st, breach, Some(node_id.as_str()), &mut tx);
            }
        }
        self.refresh_status(st, &mut tx);
        self.commit(st, tx)?;
        Ok(())
    }

    /// Retry the node under its policy, or settle it as failed and follow
    /// failure edges. Without a failure path the run fails.
    #[allow(clippy::too_many_arguments)]
    fn on_attempt_failed(
        &self,
        definition: &DagDefinition,
        st: &mut RunSnapshot,
        node_id: &str,
        attempt: u32,
        failure: ExecutorFailure,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        let Some(node) = definition.node(node_id) else {
            return;
        };
        let policy = node.retry.clone().unwrap_or_else(|| self.config.retry.clone());
        let Some(progress) = st.nodes.get_mut(node_id) else {
            return;
        };

        if should_retry(progress.entry_attempts, &failure, &policy) {
            let backoff = calculate_backoff(progress.entry_attempts, &policy);
            progress.state = NodeState::Ready;
            progress.not_before =
                Some(now + Duration::from_std(backoff).unwrap_or_default());
            warn!(
                run_id = %st.run_id,
                node_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %failure.message,
                "Node attempt failed, retrying"
            );
            tx.audit(
                AuditEvent::new(&st.run_id, AuditKind::NodeRetryScheduled)
                    .for_attempt(node_id, attempt)
                    .with_detail(json!({
                        "backoff_ms": backoff.as_millis() as u64,
                        "error": failure,
                    })),
            );
            return;
        }

        progress.state = NodeState::Failed;
        st.context.set_str(format!("{}_status", node_id), "failure");
        if self.follow_retry_edges(definition, st, node_id, false, tx) {
            return;
        }
        let alternate = definition
            .outgoing(node_id)
            .any(|e| !e.is_retry() && e.fires(false, st.context.data()));
        if alternate {
            info!(run_id = %st.run_id, node_id, "Node failed, taking failure path");
            return;
        }

        let err = if failure.kind == "timeout" {
            PhasegateError::NodeTimeout {
                node: node_id.to_string(),
                attempt,
                timeout_secs: node
                    .timeout_secs
                    .unwrap_or(self.config.orchestration.default_timeout_secs),
            }
        } else {
            PhasegateError::NodeExecution {
                node: node_id.to_string(),
                attempt,
                message: failure.message.clone(),
            }
        };
        error!(run_id = %st.run_id, node_id, attempt, error = %err, "Run failed");
        tx.audit(
            AuditEvent::new(&st.run_id, AuditKind::RunFailed)
                .for_attempt(node_id, attempt)
                .with_detail(json!({ "error": failure, "message": err.to_string() })),
        );
        st.failure = Some(err.to_string());
    }

    /// Fire the first retry edge out of `node_id` whose condition holds.
    fn follow_retry_edges(
        &self,
        definition: &DagDefinition,
        st: &mut RunSnapshot,
        node_id: &str,
        succeeded: bool,
        tx: &mut Transition,
    ) -> bool {
        let edge = definition
            .outgoing(node_id)
            .find(|e| e.is_retry() && e.fires(succeeded, st.context.data()))
            .cloned();
        match edge {
            Some(edge) => {
                self.fire_retry(definition, st, &edge, tx);
                true
            }
            None => false,
        }
    }

    /// Re-enter the retry edge's target, or fail the run once the edge has
    /// used up its iterations.
    fn fire_retry(
        &self,
        definition: &DagDefinition,
        st: &mut RunSnapshot,
        edge: &Edge,
        tx: &mut Transition,
    ) {
        let EdgeKind::Retry { max_iterations } = edge.kind else {
            return;
        };
        let label = edge.label();
        let count = st.loop_counts.get(&label).copied().unwrap_or(0) + 1;
        if count > max_iterations {
            let err = PhasegateError::LoopLimitExceeded {
                edge: label.clone(),
                max_iterations,
            };
            error!(run_id = %st.run_id, edge = %label, max_iterations, "Retry loop limit exceeded");
            tx.audit(
                AuditEvent::new(&st.run_id, AuditKind::LoopLimitExceeded)
                    .for_node(edge.from.as_str())
                    .with_detail(json!({ "edge": label, "max_iterations": max_iterations })),
            );
            st.failure = Some(err.to_string());
            return;
        }
        st.loop_counts.insert(label.clone(), count);

        let now = self.clock.now();
        let mut reset = definition.forward_descendants(&edge.to);
        reset.insert(edge.to.clone());
        for id in &reset {
            let Some(progress) = st.nodes.get_mut(id) else {
                continue;
            };
            if progress.state == NodeState::Running {
                self.budget.release(&st.run_id, progress.reserved);
                let attempt = progress.attempts;
                if let Some(exec) = st
                    .executions
                    .iter_mut()
                    .rev()
                    .find(|e| &e.node_id == id && e.attempt == attempt)
                {
                    let mut superseded = ExecutorFailure::new(
                        "superseded",
                        format!("re-entered through retry edge {}", label),
                    );
                    superseded.retryable = false;
                    exec.close(ExecutionStatus::TimedOut, now, None, 0.0, Some(superseded));
                }
            }
            progress.state = if id == &edge.to {
                NodeState::Ready
            } else {
                NodeState::Waiting
            };
            progress.entry_attempts = 0;
            progress.not_before = None;
            progress.reserved = 0.0;
        }

        info!(
            run_id = %st.run_id,
            edge = %label,
            iteration = count,
            max_iterations,
            "Retry edge fired"
        );
        tx.audit(
            AuditEvent::new(&st.run_id, AuditKind::RetryEdgeFired)
                .for_node(edge.to.as_str())
                .with_detail(json!({
                    "edge": label,
                    "iteration": count,
                    "max_iterations": max_iterations,
                    "reset": reset.len(),
                })),
        );
    }

    /// Apply a resolved gate to whatever it holds: a gate node or the run's
    /// breach hold.
    fn apply_gate_outcome(
        &self,
        definition: &DagDefinition,
        st: &mut RunSnapshot,
        gate: &GateInstance,
        escalated_to: Option<GateId>,
        tx: &mut Transition,
    ) {
        let Some(resolution) = gate.resolution else {
            return;
        };
        let kind = match resolution {
            GateResolution::Defaulted(_) => AuditKind::GateDefaulted,
            GateResolution::Approved | GateResolution::Rejected => AuditKind::GateResolved,
        };
        tx.audit(
            AuditEvent::new(&st.run_id, kind)
                .for_node(gate.node_id.as_str())
                .with_detail(json!({
                    "gate_id": gate.gate_id,
                    "resolution": resolution,
                    "approvals": gate.approvals(),
                    "rejections": gate.rejections(),
                    "waited_secs": gate.waited_secs(self.clock.now()),
                })),
        );
        if let Some(next) = &escalated_to {
            tx.audit(
                AuditEvent::new(&st.run_id, AuditKind::GateEscalated)
                    .for_node(gate.node_id.as_str())
                    .with_detail(json!({
                        "from": gate.gate_id,
                        "to": next,
                        "severity": gate.severity.saturating_add(1),
                    })),
            );
        }

        let holds_breach = st
            .breach
            .as_ref()
            .is_some_and(|b| b.gate_id == gate.gate_id);
        if holds_breach {
            match (resolution, escalated_to) {
                (GateResolution::Approved, _) => {
                    if let Some(hold) = st.breach.take() {
                        self.budget.extend_after_approval(
                            &st.run_id,
                            hold.scope,
                            self.config.budget.approval_extension_ratio,
                        );
                        info!(run_id = %st.run_id, scope = %hold.scope, "Budget extension approved");
                    }
                }
                (_, Some(next)) => {
                    if let Some(hold) = st.breach.as_mut() {
                        hold.gate_id = next;
                    }
                }
                (GateResolution::Rejected, None) => {
                    tx.emit(GateSubsystem::alert(
                        &st.run_id,
                        format!("Budget extension rejected on gate {}; run stays paused", gate.gate_id),
                    ));
                }
                (GateResolution::Defaulted(_), None) => {}
            }
            return;
        }

        let blocked = st.nodes.iter().find_map(|(id, p)| match &p.state {
            NodeState::Blocked { gate_id } if gate_id == &gate.gate_id => Some(id.clone()),
            _ => None,
        });
        let Some(node_id) = blocked else {
            debug!(run_id = %st.run_id, gate_id = %gate.gate_id, "Resolved gate no longer blocks a node");
            return;
        };

        match (resolution, escalated_to) {
            (GateResolution::Approved, _) => {
                for amendment in gate.amendments() {
                    st.context.merge_json(amendment);
                }
                st.context.set_str(format!("{}_status", node_id), "approved");
                if let Some(progress) = st.nodes.get_mut(&node_id) {
                    progress.state = NodeState::Succeeded;
                }
                self.follow_retry_edges(definition, st, &node_id, true, tx);
            }
            (GateResolution::Rejected, _) => {
                st.context.set_str(format!("{}_status", node_id), "rejected");
                let has_failure_path = definition
                    .outgoing(&node_id)
                    .any(|e| e.fires(false, st.context.data()));
                if has_failure_path {
                    if let Some(progress) = st.nodes.get_mut(&node_id) {
                        progress.state = NodeState::Failed;
                    }
                    self.follow_retry_edges(definition, st, &node_id, false, tx);
                } else {
                    tx.emit(GateSubsystem::alert(
                        &st.run_id,
                        format!(
                            "Gate {} on node '{}' was rejected; run paused for operator action",
                            gate.gate_id, node_id
                        ),
                    ));
                }
            }
            (GateResolution::Defaulted(_), Some(next)) => {
                if let Some(progress) = st.nodes.get_mut(&node_id) {
                    progress.state = NodeState::Blocked { gate_id: next };
                }
            }
            (GateResolution::Defaulted(_), None) => {}
        }
    }

    fn derive_status(st: &RunSnapshot) -> RunStatus {
        if st.status.is_terminal() {
            return st.status;
        }
        if st.failure.is_some() {
            return RunStatus::Failed;
        }
        if st.nodes.values().all(|p| p.state.is_settled()) {
            return RunStatus::Completed;
        }
        if st.operator_paused {
            return RunStatus::Paused;
        }
        if st.in_flight() > 0 {
            return RunStatus::Running;
        }
        if st.breach.is_some() {
            return RunStatus::Paused;
        }
        if st.nodes.values().any(|p| p.state == NodeState::Ready) {
            return RunStatus::Running;
        }
        RunStatus::Paused
    }

    /// Recompute the run status and record the change, if any.
    fn refresh_status(&self, st: &mut RunSnapshot, tx: &mut Transition) {
        let next = Self::derive_status(st);
        if next == st.status {
            return;
        }
        let previous = st.status;
        st.status = next;
        let run_id = st.run_id.clone();
        info!(run_id = %run_id, from = %previous, to = %next, "Run status changed");

        match next {
            RunStatus::Paused => {
                tx.audit(AuditEvent::new(&run_id, AuditKind::RunPaused).with_detail(json!({
                    "open_gates": st.gates.iter().filter(|g| g.status().is_open()).count(),
                    "breach": st.breach.is_some(),
                })));
                tx.emit(RunEvent::RunPaused { run_id });
            }
            RunStatus::Running => {
                tx.audit(AuditEvent::new(&run_id, AuditKind::RunResumed));
                tx.emit(RunEvent::RunResumed { run_id });
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Killed => {
                let cancelled = self.close_in_flight(st, ExecutorFailure::cancelled());
                if cancelled > 0 {
                    warn!(run_id = %run_id, cancelled, "Cancelling in-flight attempts of finished run");
                }
                self.budget.close_run(&run_id);
                self.metrics.record_run_finished(next);
                tx.audit(AuditEvent::new(&run_id, AuditKind::RunFinished).with_detail(json!({
                    "status": next,
                    "failure": st.failure,
                    "executions": st.executions.len(),
                    "cancelled": cancelled,
                })));
                tx.emit(RunEvent::RunFinished {
                    run_id,
                    status: next,
                });
            }
        }
    }

    /// Checkpoint the snapshot, then install its gates, then append the
    /// transition's audit entries, then publish its events.
    fn commit(&self, st: &mut RunSnapshot, tx: Transition) -> Result<u64> {
        st.updated_at = self.clock.now();
        if let Some(budget) = self.budget.snapshot(&st.run_id) {
            st.budget = budget;
        }
        let seq = self.store.append_checkpoint(&st.run_id, st)?;
        self.gates.install(&st.gates);
        for event in tx.audit {
            self.store.append_audit(event)?;
        }
        for event in tx.events {
            self.event_bus.publish(event);
        }
        Ok(seq)
    }

    /// Stop dispatching for the run, let review gates settle, but keep
    /// in-flight attempts running to completion.
    pub async fn pause(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        let mut st = handle.state.lock().await;
        if st.status.is_terminal() {
            return Err(invalid(&st, "pause"));
        }
        st.operator_paused = true;
        let mut tx = Transition::default();
        tx.audit(
            AuditEvent::new(run_id, AuditKind::RunPaused)
                .with_detail(json!({ "reason": "operator", "in_flight": st.in_flight() })),
        );
        if st.status != RunStatus::Paused {
            st.status = RunStatus::Paused;
            tx.emit(RunEvent::RunPaused {
                run_id: run_id.clone(),
            });
        }
        self.commit(&mut st, tx)?;
        info!(run_id = %run_id, "Run paused by operator");
        Ok(st.status)
    }

    /// Clear an operator pause and re-arm gates whose unfavourable
    /// resolution still holds the run. Call [`Orchestrator::advance`] to
    /// continue driving it.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        let mut st = handle.state.lock().await;
        if st.status.is_terminal() {
            return Err(invalid(&st, "resume"));
        }
        st.operator_paused = false;
        let mut tx = Transition::default();

        let mut rearmed = 0;
        let blocked: Vec<(String, GateId)> = st
            .nodes
            .iter()
            .filter_map(|(id, p)| match &p.state {
                NodeState::Blocked { gate_id } => Some((id.clone(), gate_id.clone())),
                _ => None,
            })
            .collect();
        for (node_id, gate_id) in blocked {
            let Some(severity) = stale_gate(&st, &gate_id) else {
                continue;
            };
            let Some(node) = handle.definition.node(&node_id) else {
                continue;
            };
            self.open_node_gate(&handle.definition, &mut st, node, severity, Some(gate_id), &mut tx)?;
            rearmed += 1;
        }

        if let Some(hold) = st.breach.clone() {
            if let Some(severity) = stale_gate(&st, &hold.gate_id) {
                let Some(old) = st.gate(&hold.gate_id).cloned() else {
                    return Err(PhasegateError::GateNotFound(hold.gate_id.to_string()));
                };
                let mut request = GateRequest::new(
                    run_id,
                    old.node_id.clone(),
                    old.quorum.clone(),
                    self.clock.now()
                        + clock::seconds(self.config.hrg.default_sla_secs),
                    self.config.budget.breach_action,
                )
                .with_reason(old.reason);
                request.severity = severity;
                request.escalated_from = Some(hold.gate_id.clone());
                let gate = self.gates.open(request, &mut tx.events);
                let gate_id = gate.gate_id.clone();
                st.upsert_gate(gate);
                tx.audit(
                    AuditEvent::new(run_id, AuditKind::GateCreated)
                        .for_node(old.node_id.as_str())
                        .with_detail(json!({ "gate_id": gate_id, "rearmed_from": hold.gate_id })),
                );
                if let Some(hold) = st.breach.as_mut() {
                    hold.gate_id = gate_id;
                }
                rearmed += 1;
            }
        }

        tx.audit(
            AuditEvent::new(run_id, AuditKind::RunResumed)
                .with_detail(json!({ "reason": "operator", "rearmed_gates": rearmed })),
        );
        let next = Self::derive_status(&st);
        if next != st.status {
            st.status = next;
            if next == RunStatus::Running {
                tx.emit(RunEvent::RunResumed {
                    run_id: run_id.clone(),
                });
            }
        }
        self.commit(&mut st, tx)?;
        info!(run_id = %run_id, rearmed, status = %st.status, "Run resumed by operator");
        Ok(st.status)
    }

    /// Halt the run immediately. In-flight executors are preempted and their
    /// executions recorded as timed out.
    pub async fn kill(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        let mut st = handle.state.lock().await;
        if st.status.is_terminal() && st.status != RunStatus::Killed {
            return Err(invalid(&st, "kill"));
        }
        handle.kill.cancel();
        self.finalize_kill(&mut st)?;
        Ok(st.status)
    }

    fn finalize_kill(&self, st: &mut RunSnapshot) -> Result<()> {
        if st.status == RunStatus::Killed {
            return Ok(());
        }
        let in_flight = self.close_in_flight(st, ExecutorFailure::killed());
        st.status = RunStatus::Killed;
        self.budget.close_run(&st.run_id);
        self.metrics.record_run_finished(RunStatus::Killed);

        let run_id = st.run_id.clone();
        let mut tx = Transition::default();
        tx.audit(
            AuditEvent::new(&run_id, AuditKind::KillSwitch)
                .with_detail(json!({ "in_flight": in_flight })),
        );
        tx.emit(RunEvent::RunKilled {
            run_id: run_id.clone(),
            in_flight,
        });
        tx.emit(RunEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Killed,
        });
        self.commit(st, tx)?;
        warn!(run_id = %run_id, in_flight, "Kill switch fired");
        Ok(())
    }

    /// Fail every running node, release its reservation and close its open
    /// execution as timed out with `failure`. Returns how many were running.
    fn close_in_flight(&self, st: &mut RunSnapshot, failure: ExecutorFailure) -> usize {
        let now = self.clock.now();
        let mut in_flight = 0;
        for progress in st.nodes.values_mut() {
            if progress.state == NodeState::Running {
                in_flight += 1;
                self.budget.release(&st.run_id, progress.reserved);
                progress.reserved = 0.0;
                progress.state = NodeState::Failed;
            }
        }
        for exec in st.executions.iter_mut().filter(|e| !e.status.is_closed()) {
            exec.close(ExecutionStatus::TimedOut, now, None, 0.0, Some(failure.clone()));
        }
        in_flight
    }

    /// Record a vote and apply the gate's resolution to its run.
    ///
    /// The vote is staged on the run's copy of the gate; other readers see
    /// it only once the resulting checkpoint is durable.
    pub async fn cast_vote(
        &self,
        gate_id: &GateId,
        voter_id: &str,
        decision: VoteDecision,
    ) -> Result<GateStatus> {
        let gate = self
            .gates
            .get(gate_id)
            .ok_or_else(|| PhasegateError::GateNotFound(gate_id.to_string()))?;
        let handle = self.handle(&gate.run_id)?;
        let mut st = handle.state.lock().await;

        let mut staged = st.gate(gate_id).cloned().unwrap_or(gate);
        let mut tx = Transition::default();
        let record = self.gates.vote(&mut staged, voter_id, decision, &mut tx.events)?;
        let kind = if record.late {
            AuditKind::LateVote
        } else {
            AuditKind::VoteCast
        };
        tx.audit(
            AuditEvent::new(&staged.run_id, kind)
                .for_node(staged.node_id.as_str())
                .with_detail(json!({
                    "gate_id": gate_id,
                    "voter_id": record.vote.voter_id,
                    "role": record.vote.role,
                    "decision": record.vote.decision,
                    "cast_at": record.vote.cast_at.to_rfc3339(),
                })),
        );

        // Applied to a copy; the live state only moves once the checkpoint lands.
        let mut next = st.clone();
        next.upsert_gate(staged.clone());
        if record.resolved_now && !next.status.is_terminal() {
            self.apply_gate_outcome(&handle.definition, &mut next, &staged, None, &mut tx);
            self.propagate(&handle, &mut next, &mut tx);
        }
        self.refresh_status(&mut next, &mut tx);
        self.commit(&mut next, tx)?;
        *st = next;
        if st.status.is_terminal() {
            handle.stop.cancel();
        }
        Ok(record.status)
    }

    /// Evaluate every open gate against the clock and every loaded run
    /// against its time cap. Returns how many gates resolved.
    pub async fn tick(&self) -> Result<usize> {
        let mut resolved = 0;
        for gate in self.gates.open_gates(None) {
            let Ok(handle) = self.handle(&gate.run_id) else {
                continue;
            };
            let mut st = handle.state.lock().await;
            let mut staged = st.gate(&gate.gate_id).cloned().unwrap_or(gate);
            let mut tx = Transition::default();
            let record = self.gates.expire(&mut staged, &mut tx.events);
            if !record.resolved_now {
                continue;
            }
            resolved += 1;
            st.upsert_gate(staged.clone());
            let escalated_to = record.escalated.map(|next| {
                let id = next.gate_id.clone();
                st.upsert_gate(next);
                id
            });
            if !st.status.is_terminal() {
                self.apply_gate_outcome(&handle.definition, &mut st, &staged, escalated_to, &mut tx);
                self.propagate(&handle, &mut st, &mut tx);
            }
            self.refresh_status(&mut st, &mut tx);
            self.commit(&mut st, tx)?;
            if st.status.is_terminal() {
                handle.stop.cancel();
            }
        }

        let now = self.clock.now();
        for handle in self.handles() {
            let mut st = handle.state.lock().await;
            if st.status.is_terminal() || st.breach.is_some() {
                continue;
            }
            if let Err(breach) = self.budget.check_time(&st.run_id, st.created_at, now) {
                let mut tx = Transition::default();
                self.open_breach(&mut st, breach, None, &mut tx);
                self.refresh_status(&mut st, &mut tx);
                self.commit(&mut st, tx)?;
            }
        }
        Ok(resolved)
    }

    /// A copy of the run's current state.
    pub async fn snapshot(&self, run_id: &RunId) -> Result<RunSnapshot> {
        match self.handle(run_id) {
            Ok(handle) => Ok(handle.state.lock().await.clone()),
            Err(_) => self
                .store
                .load_latest(run_id)?
                .ok_or_else(|| PhasegateError::RunNotFound(run_id.to_string())),
        }
    }

    /// Summary of a run, loaded or not.
    pub async fn status(&self, run_id: &RunId) -> Result<RunView> {
        let snapshot = self.snapshot(run_id).await?;
        let definition = match self.handle(run_id) {
            Ok(handle) => Some(handle.definition.clone()),
            Err(_) => self.store.load_definition(run_id).ok().map(Arc::new),
        };
        let nodes = snapshot
            .nodes
            .iter()
            .map(|(id, p)| NodeView {
                id: id.clone(),
                name: definition
                    .as_ref()
                    .and_then(|d| d.node(id))
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| id.clone()),
                state: p.state.clone(),
                attempts: p.attempts,
            })
            .collect();
        let open_gates = snapshot
            .gates
            .iter()
            .filter(|g| g.status().is_open())
            .cloned()
            .collect();

        Ok(RunView {
            run_id: snapshot.run_id.clone(),
            definition_id: snapshot.definition_id.clone(),
            status: snapshot.status,
            operator_paused: snapshot.operator_paused,
            failure: snapshot.failure.clone(),
            nodes,
            open_gates,
            remaining_budget: (snapshot.budget.cap - snapshot.budget.consumed - snapshot.budget.reserved)
                .max(0.0),
            budget: snapshot.budget.clone(),
            executions: snapshot.executions.len(),
            reproducibility: snapshot.reproducibility.clone(),
            checkpoint_seq: self.store.latest_seq(run_id)?,
            head_hash: self.store.head_hash(run_id)?,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        })
    }

    /// Rebuild a run from the store after a restart.
    ///
    /// Refuses to load a run whose checkpoint or audit chain fails
    /// verification. Votes audited after the last checkpoint are replayed
    /// into their gates; attempts that were in flight are closed as timed
    /// out and handed to the node's retry policy.
    pub async fn recover(&self, run_id: &RunId) -> Result<RunStatus> {
        if let Ok(handle) = self.handle(run_id) {
            return Ok(handle.state.lock().await.status);
        }

        if !self.store.checkpoints_path(run_id)?.exists() {
            return Err(PhasegateError::RunNotFound(run_id.to_string()));
        }
        self.store.claim(run_id)?;
        self.store.verify_chain(run_id)?.into_result(run_id)?;
        self.store.verify_audit(run_id)?.into_result(run_id)?;
        let definition = self.store.load_definition(run_id)?;
        let mut st = self
            .store
            .load_latest(run_id)?
            .ok_or_else(|| PhasegateError::RunNotFound(run_id.to_string()))?;
        if definition.content_hash() != st.reproducibility.definition_hash {
            return Err(PhasegateError::ChainIntegrity {
                run: run_id.to_string(),
                seq: self.store.latest_seq(run_id)?,
                reason: "stored definition does not match the run's definition hash".into(),
            });
        }
        let order = definition.topological_order()?;

        let replayed = self.replay_votes(&mut st)?;
        self.gates.restore(st.gates.clone());
        self.budget.restore(run_id, &st.budget);

        let mut tx = Transition::default();
        let mut interrupted = 0;
        if !st.status.is_terminal() {
            let running: Vec<(String, u32)> = st
                .nodes
                .iter()
                .filter(|(_, p)| p.state == NodeState::Running)
                .map(|(id, p)| (id.clone(), p.attempts))
                .collect();
            let now = self.clock.now();
            for (node_id, attempt) in running {
                interrupted += 1;
                let failure = ExecutorFailure::new(
                    "interrupted",
                    "orchestrator stopped while the attempt was in flight",
                );
                if let Some(exec) = st
                    .executions
                    .iter_mut()
                    .rev()
                    .find(|e| e.node_id == node_id && e.attempt == attempt)
                {
                    exec.close(ExecutionStatus::TimedOut, now, None, 0.0, Some(failure.clone()));
                }
                if let Some(progress) = st.nodes.get_mut(&node_id) {
                    progress.reserved = 0.0;
                }
                self.on_attempt_failed(&definition, &mut st, &node_id, attempt, failure, now, &mut tx);
            }
        }

        tx.audit(AuditEvent::new(run_id, AuditKind::RunRecovered).with_detail(json!({
            "replayed_votes": replayed,
            "interrupted": interrupted,
            "status": st.status,
        })));
        self.refresh_status(&mut st, &mut tx);
        self.commit(&mut st, tx)?;

        let status = st.status;
        info!(run_id = %run_id, status = %status, replayed, interrupted, "Run recovered");
        self.insert_handle(definition, order, st);
        Ok(status)
    }

    /// Recover every run in the store that is not already loaded. Runs that
    /// fail verification are reported and left unloaded.
    pub async fn recover_all(&self) -> Vec<(RunId, Result<RunStatus>)> {
        let runs = match self.store.list_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "Cannot list runs for recovery");
                return vec![];
            }
        };
        let mut results = Vec::new();
        for run_id in runs {
            if self.is_loaded(&run_id) {
                continue;
            }
            let result = self.recover(&run_id).await;
            if let Err(e) = &result {
                warn!(run_id = %run_id, error = %e, "Run not recovered");
            }
            results.push((run_id, result));
        }
        results
    }

    /// Resolve a gate id or unique id prefix to its run, looking at loaded
    /// gates first and then at each run's latest checkpoint. Nothing is
    /// loaded or locked.
    pub fn locate_gate(&self, prefix: &str) -> Result<(RunId, GateId)> {
        if let Some(gate) = self
            .gates
            .find_by_prefix(prefix)
            .and_then(|id| self.gates.get(&id))
        {
            return Ok((gate.run_id, gate.gate_id));
        }
        let mut found: Option<(RunId, GateId)> = None;
        for run_id in self.store.list_runs()? {
            let Some(snapshot) = self.store.load_latest(&run_id)? else {
                continue;
            };
            for gate in snapshot.gates.iter().filter(|g| g.gate_id.0.starts_with(prefix)) {
                if found.is_some() {
                    // Ambiguous prefixes resolve to nothing.
                    return Err(PhasegateError::GateNotFound(prefix.to_string()));
                }
                found = Some((run_id.clone(), gate.gate_id.clone()));
            }
        }
        found.ok_or_else(|| PhasegateError::GateNotFound(prefix.to_string()))
    }

    /// Votes audited after the last checkpoint but missing from its gates.
    fn replay_votes(&self, st: &mut RunSnapshot) -> Result<usize> {
        let since = self.store.latest_seq(&st.run_id)?;
        let mut replayed = 0;
        for entry in self.store.audit_since(&st.run_id, since)? {
            let late = match entry.kind {
                AuditKind::VoteCast => false,
                AuditKind::LateVote => true,
                _ => continue,
            };
            let Some(vote) = vote_from_detail(&entry.detail) else {
                continue;
            };
            let Some(gate_id) = entry.detail.get("gate_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(gate) = st.gates.iter_mut().find(|g| g.gate_id.0 == gate_id) else {
                continue;
            };
            let known = gate
                .votes
                .iter()
                .chain(gate.late_votes.iter())
                .any(|v| v.voter_id == vote.voter_id);
            if known {
                continue;
            }
            if late || !gate.status().is_open() {
                gate.late_votes.push(vote);
            } else {
                gate.votes.push(vote);
            }
            replayed += 1;
        }
        Ok(replayed)
    }
}

/// Severity of a gate whose unfavourable resolution still holds the run.
fn stale_gate(st: &RunSnapshot, gate_id: &GateId) -> Option<u8> {
    st.gate(gate_id)
        .filter(|g| g.resolution.is_some_and(|r| r != GateResolution::Approved))
        .map(|g| g.severity)
}

fn invalid(st: &RunSnapshot, action: &str) -> PhasegateError {
    PhasegateError::InvalidTransition {
        run: st.run_id.to_string(),
        action: action.to_string(),
        status: st.status.to_string(),
    }
}

fn vote_from_detail(detail: &serde_json::Value) -> Option<Vote> {
    Some(Vote {
        voter_id: detail.get("voter_id")?.as_str()?.to_string(),
        role: detail
            .get("role")
            .and_then(|r| r.as_str())
            .map(String::from),
        decision: serde_json::from_value(detail.get("decision")?.clone()).ok()?,
        cast_at: detail
            .get("cast_at")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))?,
    })
}
