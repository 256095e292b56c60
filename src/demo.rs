//! Self-contained demonstration: an eight-phase pipeline with four review
//! gates, approved by scripted reviewers, on a scratch ledger.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use phasegate_core::config::AppConfig;
use phasegate_core::gate::{GateStatus, VoteDecision};
use phasegate_engine::{AuditFilter, DagDefinition, Edge, GateSpec, Orchestrator, PhaseNode};

use crate::exit_codes;

const DEMO_SEED: u64 = 42;
const DEMO_COST_CAP: f64 = 50.0;
const REVIEWERS: [&str; 2] = ["demo-reviewer", "demo-auditor"];
/// Upper bound on advance/vote rounds; the pipeline needs five.
const MAX_ROUNDS: usize = 16;

/// Demo overrides, applied before the configuration is validated.
pub fn prepare(config: &mut AppConfig) {
    config.orchestration.seed.get_or_insert(DEMO_SEED);
    config
        .orchestration
        .pinned_models
        .entry("demo-model".to_string())
        .or_insert_with(|| "v1.0.0-demo".to_string());
    config.budget.run_cost_cap.get_or_insert(DEMO_COST_CAP);
    if config.store.dir.is_none() {
        let dir = std::env::temp_dir().join(format!("phasegate-demo-{}", std::process::id()));
        config.store.dir = Some(dir.display().to_string());
    }
    if !config.hrg.roles.is_empty() {
        for reviewer in REVIEWERS {
            config
                .hrg
                .roles
                .entry(reviewer.to_string())
                .or_insert_with(|| "reviewer".to_string());
        }
    }
}

fn phase(id: &str, name: &str, cost: f64) -> PhaseNode {
    PhaseNode::new(id, name)
        .with_params(json!({ "phase": id, "cost": cost }))
        .with_estimated_cost(cost)
}

pub fn pipeline() -> DagDefinition {
    DagDefinition::new("demo-eight-phase")
        .with_node(phase("intake", "Intake", 0.5))
        .with_node(phase("analyze", "Analyze", 2.0))
        .with_node(PhaseNode::gate("scope_review", "Scope review", GateSpec::approvals(1)))
        .with_node(phase("draft", "Draft", 4.0))
        .with_node(phase("critique", "Critique", 2.0))
        .with_node(PhaseNode::gate("draft_review", "Draft review", GateSpec::approvals(2)))
        .with_node(phase("revise", "Revise", 3.0))
        .with_node(
            PhaseNode::new("validate", "Validate")
                .with_params(json!({ "phase": "validate", "cost": 1.0, "verdict": "pass" }))
                .with_estimated_cost(1.0)
                .with_outputs(vec!["verdict".to_string()]),
        )
        .with_node(PhaseNode::gate("ethics_review", "Ethics review", GateSpec::approvals(1)))
        .with_node(phase("package", "Package", 1.0))
        .with_node(PhaseNode::gate("release_review", "Release review", GateSpec::approvals(1)))
        .with_node(phase("publish", "Publish", 0.5))
        .with_edge(Edge::always("intake", "analyze"))
        .with_edge(Edge::always("analyze", "scope_review"))
        .with_edge(Edge::always("scope_review", "draft"))
        .with_edge(Edge::always("draft", "critique"))
        .with_edge(Edge::always("critique", "draft_review"))
        .with_edge(Edge::always("draft_review", "revise"))
        .with_edge(Edge::always("revise", "validate"))
        .with_edge(Edge::conditional("validate", "revise", "verdict == \"revise\"").retry(2))
        .with_edge(Edge::conditional("validate", "ethics_review", "verdict == \"pass\""))
        .with_edge(Edge::always("ethics_review", "package"))
        .with_edge(Edge::always("package", "release_review"))
        .with_edge(Edge::always("release_review", "publish"))
}

fn print_stage(stage: &str, body: serde_json::Value) -> anyhow::Result<()> {
    let mut doc = json!({ "stage": stage });
    if let (Some(doc), serde_json::Value::Object(body)) = (doc.as_object_mut(), body) {
        doc.extend(body);
    }
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// Drive the demo run to completion and print its reports.
pub async fn run(orchestrator: Arc<Orchestrator>) -> anyhow::Result<u8> {
    print_stage(
        "init",
        json!({
            "message": "Initializing demo run",
            "store_dir": orchestrator.store().dir(),
        }),
    )?;

    let run_id = orchestrator
        .start_run(
            pipeline(),
            json!({
                "data": { "records": 100, "format": "demo" },
                "source": "demo-cli",
            }),
        )
        .await?;
    print_stage("execute", json!({ "message": "Executing eight-phase pipeline", "run_id": run_id }))?;

    let mut status = orchestrator.advance(&run_id).await?;
    for _ in 0..MAX_ROUNDS {
        if status.is_terminal() {
            break;
        }
        let open = orchestrator.gates().open_gates(Some(&run_id));
        if open.is_empty() {
            break;
        }
        for gate in open {
            for reviewer in REVIEWERS {
                let outcome = orchestrator
                    .cast_vote(&gate.gate_id, reviewer, VoteDecision::Approve)
                    .await?;
                info!(gate_id = %gate.gate_id, node_id = %gate.node_id, reviewer, "Scripted approval");
                if outcome != GateStatus::Open {
                    break;
                }
            }
        }
        status = orchestrator.advance(&run_id).await?;
    }

    let view = orchestrator.status(&run_id).await?;
    let audit = orchestrator.store().query_audit(&run_id, &AuditFilter::default())?;
    let checkpoints = orchestrator.store().verify_chain(&run_id)?;
    let audit_chain = orchestrator.store().verify_audit(&run_id)?;

    print_stage("result", json!({ "status": view }))?;
    print_stage(
        "reports",
        json!({
            "audit_trail": audit,
            "verification": { "checkpoints": checkpoints, "audit": audit_chain },
            "reproducibility": {
                "seed": view.reproducibility.seed,
                "pinned_models": view.reproducibility.pinned_models,
                "model": view.reproducibility.model,
                "definition_hash": view.reproducibility.definition_hash,
                "checkpoint_head_hash": view.head_hash,
            },
            "budget": {
                "cap": view.budget.cap,
                "consumed": view.budget.consumed,
                "remaining": view.remaining_budget,
            },
        }),
    )?;
    print_stage(
        "complete",
        json!({ "message": format!("Demo finished: {}", status), "run_id": run_id }),
    )?;

    Ok(exit_codes::for_status(status))
}
