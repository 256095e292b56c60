use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use phasegate_core::error::PhasegateError;
use phasegate_core::gate::{DefaultAction, GateReason, GateResolution, GateStatus, VoteDecision};
use phasegate_core::types::{ExecutionStatus, GateId, RunEvent, RunId, RunStatus, TaskResult};
use phasegate_engine::{
    AuditFilter, AuditKind, BudgetScope, CheckpointStore, DagDefinition, Edge, ExecutorRegistry,
    NodeState, Orchestrator, PhaseNode,
};
use phasegate_test_utils::{linear_gate_definition, test_config, ScriptedExecutor, TestHarness};

fn sleeper() -> ScriptedExecutor {
    ScriptedExecutor::succeeding("sleeper").with_delay(StdDuration::from_secs(60))
}

fn registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(sleeper());
    registry
}

fn harness() -> TestHarness {
    TestHarness::with(test_config(), registry())
}

fn open_gate(orch: &Orchestrator, run_id: &RunId) -> GateId {
    orch.gates().open_gates(Some(run_id))[0].gate_id.clone()
}

fn audit_kinds(orch: &Orchestrator, run_id: &RunId) -> Vec<AuditKind> {
    orch.store()
        .query_audit(run_id, &AuditFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn gate_with_quorum_of_two_holds_until_both_approve() {
    let h = harness();
    let orch = &h.orchestrator;
    let run = orch.start_run(linear_gate_definition(2), serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(snap.node("ingest").unwrap().state, NodeState::Succeeded);
    assert!(matches!(snap.node("review").unwrap().state, NodeState::Blocked { .. }));
    assert_eq!(snap.node("publish").unwrap().state, NodeState::Waiting);

    let gate = open_gate(orch, &run);
    let status = orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    assert_eq!(status, GateStatus::Open);
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);

    let status = orch.cast_vote(&gate, "bob", VoteDecision::Approve).await.unwrap();
    assert_eq!(status, GateStatus::Resolved(GateResolution::Approved));
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);

    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(
        snap.context.get("ingest"),
        Some(&serde_json::json!({"rows": 10, "cost": 1.0}))
    );
    assert_eq!(snap.context.get_str("review_status"), Some("approved"));
    assert_eq!(snap.executions.len(), 2);
    assert!(orch.store().verify_chain(&run).unwrap().is_valid());
    assert!(orch.store().verify_audit(&run).unwrap().is_valid());
}

#[tokio::test]
async fn sla_expiry_pauses_and_alerts() {
    let mut config = test_config();
    config.hrg.default_sla_secs = 3600;
    config.hrg.default_action = DefaultAction::PauseAndAlert;
    let h = TestHarness::with(config, registry());
    let orch = &h.orchestrator;
    let mut events = orch.event_bus().subscribe();

    let run = orch.start_run(linear_gate_definition(1), serde_json::json!({})).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    let gate = open_gate(orch, &run);

    assert_eq!(orch.tick().await.unwrap(), 0);
    h.clock.advance(Duration::hours(2));
    assert_eq!(orch.tick().await.unwrap(), 1);

    let resolved = orch.gates().get(&gate).unwrap();
    assert_eq!(
        resolved.resolution,
        Some(GateResolution::Defaulted(DefaultAction::PauseAndAlert))
    );
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    assert!(audit_kinds(orch, &run).contains(&AuditKind::GateDefaulted));

    let mut alerted = false;
    while let Ok(event) = events.try_recv() {
        alerted |= matches!(event, RunEvent::Alert { .. });
    }
    assert!(alerted);

    // A late approval is recorded but does not release the node.
    let status = orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    assert!(matches!(status, GateStatus::Resolved(GateResolution::Defaulted(_))));
    assert!(audit_kinds(orch, &run).contains(&AuditKind::LateVote));

    // Resume re-arms a fresh gate on the node.
    orch.resume(&run).await.unwrap();
    let fresh = open_gate(orch, &run);
    assert_ne!(fresh, gate);
    orch.cast_vote(&fresh, "alice", VoteDecision::Approve).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn escalation_reblocks_node_on_new_gate() {
    let mut config = test_config();
    config.hrg.default_sla_secs = 60;
    config.hrg.default_action = DefaultAction::Escalate;
    let h = TestHarness::with(config, registry());
    let orch = &h.orchestrator;

    let run = orch.start_run(linear_gate_definition(1), serde_json::json!({})).await.unwrap();
    orch.advance(&run).await.unwrap();
    let first = open_gate(orch, &run);

    h.clock.advance(Duration::minutes(2));
    orch.tick().await.unwrap();
    let second = open_gate(orch, &run);
    assert_ne!(first, second);
    assert_eq!(orch.gates().get(&second).unwrap().severity, 2);

    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(
        snap.node("review").unwrap().state,
        NodeState::Blocked { gate_id: second.clone() }
    );
    assert!(audit_kinds(orch, &run).contains(&AuditKind::GateEscalated));

    orch.cast_vote(&second, "carol", VoteDecision::Approve).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn node_fails_run_after_exhausting_attempts() {
    let scripted = Arc::new(ScriptedExecutor::failing("scripted", "step exploded"));
    let mut executors = registry();
    executors.register_arc(scripted.clone());
    let h = TestHarness::with(test_config(), executors);
    let orch = &h.orchestrator;

    let def = DagDefinition::new("flaky")
        .with_node(PhaseNode::new("extract", "Extract").with_executor("scripted"))
        .with_node(PhaseNode::new("load", "Load"))
        .with_edge(Edge::always("extract", "load"));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Failed);
    assert_eq!(scripted.calls(), 3);

    let snap = orch.snapshot(&run).await.unwrap();
    let attempts: Vec<_> = snap.executions_for("extract").collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(
        attempts.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(snap.failure.as_ref().unwrap().contains("step exploded"));
    assert_eq!(snap.executions_for("load").count(), 0);

    let kinds = audit_kinds(orch, &run);
    assert_eq!(
        kinds.iter().filter(|k| **k == AuditKind::NodeRetryScheduled).count(),
        2
    );
    assert!(kinds.contains(&AuditKind::RunFailed));
}

#[tokio::test]
async fn failure_edge_takes_alternate_path() {
    let mut executors = registry();
    executors.register(ScriptedExecutor::failing("scripted", "step exploded"));
    let h = TestHarness::with(test_config(), executors);
    let orch = &h.orchestrator;

    let def = DagDefinition::new("fallback")
        .with_node(
            PhaseNode::new("primary", "Primary")
                .with_executor("scripted")
                .with_max_attempts(1),
        )
        .with_node(PhaseNode::new("happy", "Happy path"))
        .with_node(PhaseNode::new("fallback", "Fallback"))
        .with_node(PhaseNode::new("report", "Report"))
        .with_edge(Edge::always("primary", "happy"))
        .with_edge(Edge::on_failure("primary", "fallback"))
        .with_edge(Edge::always("happy", "report"))
        .with_edge(Edge::always("fallback", "report"));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(snap.node("primary").unwrap().state, NodeState::Failed);
    assert_eq!(snap.node("happy").unwrap().state, NodeState::Skipped);
    assert_eq!(snap.node("fallback").unwrap().state, NodeState::Succeeded);
    assert_eq!(snap.node("report").unwrap().state, NodeState::Succeeded);
    assert_eq!(snap.context.get_str("primary_status"), Some("failure"));
}

#[tokio::test]
async fn retry_edge_stops_at_loop_limit() {
    let h = harness();
    let orch = &h.orchestrator;
    let def = DagDefinition::new("loop")
        .with_node(PhaseNode::new("draft", "Draft"))
        .with_node(PhaseNode::new("critique", "Critique"))
        .with_edge(Edge::always("draft", "critique"))
        .with_edge(Edge::always("critique", "draft").retry(2));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Failed);
    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(snap.loop_counts.get("critique->draft"), Some(&2));
    assert_eq!(snap.executions_for("draft").count(), 3);
    assert!(snap.failure.unwrap().contains("loop limit"));

    let kinds = audit_kinds(orch, &run);
    assert_eq!(
        kinds.iter().filter(|k| **k == AuditKind::RetryEdgeFired).count(),
        2
    );
    assert!(kinds.contains(&AuditKind::LoopLimitExceeded));
}

#[tokio::test]
async fn conditional_retry_edge_reenters_until_condition_clears() {
    let scripted = ScriptedExecutor::with_fallback(
        "scripted",
        TaskResult::success(serde_json::json!({"verdict": "ok"}), 0.0),
    )
    .then(TaskResult::success(serde_json::json!({"verdict": "redo"}), 0.0));
    let mut executors = registry();
    executors.register(scripted);
    let h = TestHarness::with(test_config(), executors);
    let orch = &h.orchestrator;

    let def = DagDefinition::new("review-loop")
        .with_node(PhaseNode::new("draft", "Draft"))
        .with_node(
            PhaseNode::new("check", "Check")
                .with_executor("scripted")
                .with_outputs(vec!["verdict".into()]),
        )
        .with_edge(Edge::always("draft", "check"))
        .with_edge(Edge::conditional("check", "draft", "verdict == \"redo\"").retry(3));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(snap.loop_counts.get("check->draft"), Some(&1));
    assert_eq!(snap.executions_for("draft").count(), 2);
    assert_eq!(snap.context.get_str("verdict"), Some("ok"));
}

#[tokio::test]
async fn budget_breach_pauses_behind_review_gate() {
    let mut config = test_config();
    config.budget.run_cost_cap = Some(10.0);
    let h = TestHarness::with(config, registry());
    let orch = &h.orchestrator;

    let def = DagDefinition::new("spendy")
        .with_node(
            PhaseNode::new("train", "Train")
                .with_estimated_cost(4.0)
                .with_params(serde_json::json!({"cost": 12.0})),
        )
        .with_node(PhaseNode::new("eval", "Evaluate").with_estimated_cost(2.0))
        .with_edge(Edge::always("train", "eval"));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    let snap = orch.snapshot(&run).await.unwrap();
    let hold = snap.breach.clone().unwrap();
    assert_eq!(hold.scope, BudgetScope::Run);
    assert_eq!(snap.budget.consumed, 12.0);
    assert_eq!(snap.node("eval").unwrap().state, NodeState::Ready);

    let gate = orch.gates().get(&hold.gate_id).unwrap();
    assert_eq!(gate.reason, GateReason::BudgetBreach);
    assert!(audit_kinds(orch, &run).contains(&AuditKind::BudgetBreach));

    // Approval extends the cap by half, which covers the next estimate.
    orch.cast_vote(&hold.gate_id, "finance", VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    let snap = orch.snapshot(&run).await.unwrap();
    assert!(snap.breach.is_none());
    assert_eq!(snap.budget.cap, 15.0);
}

#[tokio::test]
async fn kill_preempts_in_flight_work() {
    let h = harness();
    let orch = &h.orchestrator;
    let def = DagDefinition::new("slow")
        .with_node(PhaseNode::new("crunch", "Crunch").with_executor("sleeper"))
        .with_node(PhaseNode::new("after", "After"))
        .with_edge(Edge::always("crunch", "after"));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    let driver = {
        let orch = orch.clone();
        let run = run.clone();
        tokio::spawn(async move { orch.advance(&run).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(orch.kill(&run).await.unwrap(), RunStatus::Killed);

    let driven = tokio::time::timeout(StdDuration::from_secs(5), driver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(driven, RunStatus::Killed);

    let snap = orch.snapshot(&run).await.unwrap();
    let exec = snap.executions_for("crunch").next().unwrap();
    assert_eq!(exec.status, ExecutionStatus::TimedOut);
    assert_eq!(exec.error.as_ref().unwrap().kind, "killed");
    assert_eq!(snap.node("after").unwrap().state, NodeState::Waiting);
    assert!(audit_kinds(orch, &run).contains(&AuditKind::KillSwitch));

    // Killed runs stay killed.
    assert_eq!(orch.kill(&run).await.unwrap(), RunStatus::Killed);
    assert!(orch.resume(&run).await.is_err());
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Killed);
}

#[tokio::test]
async fn failed_run_cancels_sibling_attempts() {
    let mut executors = registry();
    executors.register(ScriptedExecutor::failing("scripted", "shard lost"));
    let h = TestHarness::with(test_config(), executors);
    let orch = &h.orchestrator;

    let def = DagDefinition::new("fan-out")
        .with_node(
            PhaseNode::new("fast", "Fast")
                .with_executor("scripted")
                .with_max_attempts(1),
        )
        .with_node(
            PhaseNode::new("slow", "Slow")
                .with_executor("sleeper")
                .with_estimated_cost(3.0),
        );
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    let status = tokio::time::timeout(StdDuration::from_secs(5), orch.advance(&run))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, RunStatus::Failed);

    let snap = orch.snapshot(&run).await.unwrap();
    assert!(snap.failure.as_deref().unwrap().contains("shard lost"));
    let slow = snap.node("slow").unwrap();
    assert_eq!(slow.state, NodeState::Failed);
    assert_eq!(slow.reserved, 0.0);
    let exec = snap.executions_for("slow").next().unwrap();
    assert_eq!(exec.status, ExecutionStatus::TimedOut);
    assert_eq!(exec.error.as_ref().unwrap().kind, "cancelled");
    assert_eq!(snap.in_flight(), 0);
    assert!(orch.store().verify_chain(&run).unwrap().is_valid());
}

#[tokio::test]
async fn disabled_review_gates_are_bypassed() {
    let mut config = test_config();
    config.hrg.enabled = false;
    let h = TestHarness::with(config, registry());
    let orch = &h.orchestrator;

    let run = orch.start_run(linear_gate_definition(3), serde_json::json!({})).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    assert!(audit_kinds(orch, &run).contains(&AuditKind::GateBypassed));
}

#[tokio::test]
async fn operator_pause_holds_dispatch_until_resume() {
    let h = harness();
    let orch = &h.orchestrator;
    let def = DagDefinition::new("two-step")
        .with_node(PhaseNode::new("a", "A"))
        .with_node(PhaseNode::new("b", "B"))
        .with_edge(Edge::always("a", "b"));
    let run = orch.start_run(def, serde_json::json!({})).await.unwrap();

    assert_eq!(orch.pause(&run).await.unwrap(), RunStatus::Paused);
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    assert!(orch.snapshot(&run).await.unwrap().executions.is_empty());

    assert_eq!(orch.resume(&run).await.unwrap(), RunStatus::Running);
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn rejection_keeps_run_paused() {
    let h = harness();
    let orch = &h.orchestrator;
    let run = orch.start_run(linear_gate_definition(2), serde_json::json!({})).await.unwrap();
    orch.advance(&run).await.unwrap();

    let gate = open_gate(orch, &run);
    orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    let status = orch.cast_vote(&gate, "bob", VoteDecision::Reject).await.unwrap();
    assert_eq!(status, GateStatus::Resolved(GateResolution::Rejected));
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);

    let snap = orch.snapshot(&run).await.unwrap();
    assert_eq!(snap.context.get_str("review_status"), Some("rejected"));
    assert_eq!(snap.node("publish").unwrap().state, NodeState::Waiting);
}

#[tokio::test]
async fn duplicate_vote_is_refused() {
    let h = harness();
    let orch = &h.orchestrator;
    let run = orch.start_run(linear_gate_definition(2), serde_json::json!({})).await.unwrap();
    orch.advance(&run).await.unwrap();
    let gate = open_gate(orch, &run);

    orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    let err = orch
        .cast_vote(&gate, "alice", VoteDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, PhasegateError::DuplicateVote { .. }));
}

#[tokio::test]
async fn vote_that_cannot_be_checkpointed_changes_nothing() {
    let h = harness();
    let orch = &h.orchestrator;
    let run = orch.start_run(linear_gate_definition(1), serde_json::json!({})).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    let gate = open_gate(orch, &run);
    let mut events = orch.event_bus().subscribe();

    // Another process takes the ledger, so the vote's checkpoint is refused.
    orch.store().release_all();
    let rival = CheckpointStore::open(h.dir.path(), h.clock.clone()).unwrap();
    rival.claim(&run).unwrap();

    let err = orch
        .cast_vote(&gate, "alice", VoteDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, PhasegateError::RunLocked { .. }));

    let installed = orch.gates().get(&gate).unwrap();
    assert!(installed.votes.is_empty());
    assert_eq!(installed.status(), GateStatus::Open);
    let snap = orch.snapshot(&run).await.unwrap();
    assert!(snap.gate(&gate).unwrap().votes.is_empty());
    assert_eq!(snap.status, RunStatus::Paused);
    assert!(events.try_recv().is_err());

    drop(rival);
    let status = orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    assert_eq!(status, GateStatus::Resolved(GateResolution::Approved));
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    assert!(orch.store().verify_chain(&run).unwrap().is_valid());
}

#[tokio::test]
async fn recovery_resumes_paused_run_in_new_process() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(linear_gate_definition(1), serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.advance(&run).await.unwrap(), RunStatus::Paused);

    let restarted = h.restart();
    assert_eq!(restarted.recover(&run).await.unwrap(), RunStatus::Paused);
    let gate = open_gate(&restarted, &run);
    restarted
        .cast_vote(&gate, "alice", VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(restarted.advance(&run).await.unwrap(), RunStatus::Completed);
    assert!(audit_kinds(&restarted, &run).contains(&AuditKind::RunRecovered));
    assert!(restarted.store().verify_chain(&run).unwrap().is_valid());
}

#[tokio::test]
async fn live_run_cannot_be_recovered_by_a_second_process() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(linear_gate_definition(1), serde_json::json!({}))
        .await
        .unwrap();
    h.orchestrator.advance(&run).await.unwrap();

    let store = CheckpointStore::open(h.dir.path(), h.clock.clone()).unwrap();
    let second = Orchestrator::builder(Arc::new(test_config()))
        .store(Arc::new(store))
        .executors(registry())
        .clock(h.clock.clone())
        .build()
        .unwrap();
    let err = second.recover(&run).await.unwrap_err();
    assert!(matches!(err, PhasegateError::RunLocked { .. }));
    assert!(!second.is_loaded(&run));
    assert_eq!(h.orchestrator.status(&run).await.unwrap().status, RunStatus::Paused);
}

#[tokio::test]
async fn voting_by_gate_prefix_touches_only_that_run() {
    let h = harness();
    let mut runs = Vec::new();
    for _ in 0..2 {
        let run = h
            .orchestrator
            .start_run(linear_gate_definition(1), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(h.orchestrator.advance(&run).await.unwrap(), RunStatus::Paused);
        runs.push(run);
    }
    let (target, other) = (&runs[0], &runs[1]);
    let gate = open_gate(&h.orchestrator, target);

    let restarted = h.restart();
    let (run_id, gate_id) = restarted.locate_gate(&gate.0[..8]).unwrap();
    assert_eq!((&run_id, &gate_id), (target, &gate));
    assert!(!restarted.is_loaded(target));
    assert!(!restarted.store().owns(target));

    restarted.recover(&run_id).await.unwrap();
    restarted
        .cast_vote(&gate_id, "alice", VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(restarted.advance(&run_id).await.unwrap(), RunStatus::Completed);

    assert!(!restarted.is_loaded(other));
    assert!(!restarted.store().owns(other));
    assert!(!audit_kinds(&restarted, other).contains(&AuditKind::RunRecovered));
    assert!(matches!(
        restarted.locate_gate("no-such-gate"),
        Err(PhasegateError::GateNotFound(_))
    ));
}

#[tokio::test]
async fn recovery_refuses_tampered_chain() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(linear_gate_definition(1), serde_json::json!({}))
        .await
        .unwrap();
    h.orchestrator.advance(&run).await.unwrap();

    let path = h.orchestrator.store().checkpoints_path(&run).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("ingest", "inGest", 1)).unwrap();

    let restarted = h.restart();
    let err = restarted.recover(&run).await.unwrap_err();
    assert!(matches!(err, PhasegateError::ChainIntegrity { .. }));
    assert!(!restarted.is_loaded(&run));
}

#[tokio::test]
async fn start_requires_cost_cap_and_known_executors() {
    let mut config = test_config();
    config.budget.run_cost_cap = None;
    let h = TestHarness::with(config, registry());
    let err = h
        .orchestrator
        .start_run(linear_gate_definition(1), serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PhasegateError::Config(_)));

    let h = harness();
    let def = DagDefinition::new("unknown")
        .with_node(PhaseNode::new("a", "A").with_executor("teleport"));
    let err = h.orchestrator.start_run(def, serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, PhasegateError::ExecutorNotFound(_)));
}

#[tokio::test]
async fn status_view_reports_progress() {
    let h = harness();
    let orch = &h.orchestrator;
    let run = orch.start_run(linear_gate_definition(1), serde_json::json!({})).await.unwrap();
    orch.advance(&run).await.unwrap();

    let view = orch.status(&run).await.unwrap();
    assert_eq!(view.status, RunStatus::Paused);
    assert_eq!(view.open_gates.len(), 1);
    assert_eq!(view.nodes.len(), 3);
    assert!(view.checkpoint_seq > 0);
    assert!(view.head_hash.is_some());
    assert_eq!(view.remaining_budget, 99.0);
}
