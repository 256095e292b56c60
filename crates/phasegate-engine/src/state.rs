use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use phasegate_core::config::ModelSelection;
use phasegate_core::gate::GateInstance;
use phasegate_core::types::{GateId, NodeExecution, RunId, RunStatus};

use crate::budget::{BudgetScope, BudgetSnapshot};
use crate::graph::RunContext;

/// Per-node position in the run state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Waiting,
    Ready,
    Running,
    /// Gate node waiting on a review gate.
    Blocked { gate_id: GateId },
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    /// Settled nodes no longer change unless a retry edge re-enters them.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub state: NodeState,
    /// Attempt counter. Keeps counting across retry-edge re-entries.
    #[serde(default)]
    pub attempts: u32,
    /// Attempts since the node was last (re-)entered, checked against the
    /// node's retry policy.
    #[serde(default)]
    pub entry_attempts: u32,
    /// Earliest time the next attempt may start.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Cost reserved for the attempt in flight.
    #[serde(default)]
    pub reserved: f64,
}

impl NodeProgress {
    pub fn waiting() -> Self {
        Self {
            state: NodeState::Waiting,
            attempts: 0,
            entry_attempts: 0,
            not_before: None,
            reserved: 0.0,
        }
    }
}

/// A budget or TTL gate holding the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachHold {
    pub gate_id: GateId,
    pub scope: BudgetScope,
    /// Node whose dispatch or result triggered the breach.
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Data recorded so a run can be reproduced later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reproducibility {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub pinned_models: BTreeMap<String, String>,
    #[serde(default)]
    pub model: Option<ModelSelection>,
    pub definition_hash: String,
}

/// Full run state. Every checkpoint stores one of these, and recovery
/// rebuilds a run from the latest one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub definition_id: String,
    pub status: RunStatus,
    /// Set by an explicit `pause`; cleared only by `resume`.
    #[serde(default)]
    pub operator_paused: bool,
    pub nodes: BTreeMap<String, NodeProgress>,
    /// Every node execution, in dispatch order. Closed records never change.
    #[serde(default)]
    pub executions: Vec<NodeExecution>,
    #[serde(default)]
    pub context: RunContext,
    /// Gate instances belonging to this run, as last seen by the coordinator.
    #[serde(default)]
    pub gates: Vec<GateInstance>,
    /// Fired-iteration count per retry edge, keyed by `from->to`.
    #[serde(default)]
    pub loop_counts: BTreeMap<String, u32>,
    pub budget: BudgetSnapshot,
    #[serde(default)]
    pub breach: Option<BreachHold>,
    /// Reason the run failed, if it did.
    #[serde(default)]
    pub failure: Option<String>,
    pub reproducibility: Reproducibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn node(&self, id: &str) -> Option<&NodeProgress> {
        self.nodes.get(id)
    }

    /// Executions of one node, oldest first.
    pub fn executions_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeExecution> + 'a {
        self.executions.iter().filter(move |e| e.node_id == node_id)
    }

    pub fn in_flight(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Running)
            .count()
    }

    pub fn gate(&self, gate_id: &GateId) -> Option<&GateInstance> {
        self.gates.iter().find(|g| &g.gate_id == gate_id)
    }

    /// Replace or add a gate record.
    pub fn upsert_gate(&mut self, gate: GateInstance) {
        match self.gates.iter_mut().find(|g| g.gate_id == gate.gate_id) {
            Some(existing) => *existing = gate,
            None => self.gates.push(gate),
        }
    }
}
