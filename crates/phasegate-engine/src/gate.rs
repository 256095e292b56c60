use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use phasegate_core::clock::Clock;
use phasegate_core::config::HrgConfig;
use phasegate_core::error::{PhasegateError, Result};
use phasegate_core::gate::{
    DefaultAction, GateInstance, GateReason, GateResolution, GateStatus, QuorumSpec, Vote,
    VoteDecision,
};
use phasegate_core::metrics::Metrics;
use phasegate_core::types::{GateId, RunEvent, RunId};

/// Voter id recorded when review gates are disabled.
pub const BYPASS_VOTER: &str = "system:hrg-disabled";

/// Parameters of a new gate instance.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub quorum: QuorumSpec,
    pub sla_deadline: DateTime<Utc>,
    pub default_action: DefaultAction,
    pub reason: GateReason,
    pub severity: u8,
    pub escalated_from: Option<GateId>,
}

impl GateRequest {
    pub fn new(
        run_id: &RunId,
        node_id: impl Into<String>,
        quorum: QuorumSpec,
        sla_deadline: DateTime<Utc>,
        default_action: DefaultAction,
    ) -> Self {
        Self {
            run_id: run_id.clone(),
            node_id: node_id.into(),
            quorum,
            sla_deadline,
            default_action,
            reason: GateReason::NodeReached,
            severity: 1,
            escalated_from: None,
        }
    }

    pub fn with_reason(mut self, reason: GateReason) -> Self {
        self.reason = reason;
        self
    }
}

/// What a vote did.
#[derive(Debug, Clone)]
pub struct VoteRecord {
    pub vote: Vote,
    pub status: GateStatus,
    /// This vote resolved the gate.
    pub resolved_now: bool,
    /// The gate was already resolved; the vote was recorded but not counted.
    pub late: bool,
}

/// What an expiry check did.
#[derive(Debug, Clone)]
pub struct ExpiryRecord {
    pub status: GateStatus,
    /// The check resolved the gate (quorum or default action).
    pub resolved_now: bool,
    /// Gate opened by an `escalate` default action, not yet installed.
    pub escalated: Option<GateInstance>,
}

/// Human review gates: quorum, SLA timers, default actions, escalation.
///
/// Mutations work on a caller-owned copy of a gate. The orchestrator stages
/// that copy in the run snapshot, checkpoints it, and only then calls
/// [`GateSubsystem::install`], so readers never see a gate state the ledger
/// does not hold. Events produced by a mutation are pushed onto the caller's
/// list and published after the same checkpoint.
pub struct GateSubsystem {
    hrg: HrgConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    gates: RwLock<HashMap<GateId, GateInstance>>,
}

impl GateSubsystem {
    pub fn new(hrg: HrgConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            hrg,
            clock,
            metrics,
            gates: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HrgConfig {
        &self.hrg
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<GateId, GateInstance>> {
        self.gates.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<GateId, GateInstance>> {
        self.gates.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Build a new open gate.
    pub fn open(&self, request: GateRequest, events: &mut Vec<RunEvent>) -> GateInstance {
        let gate = GateInstance {
            gate_id: GateId::new(),
            run_id: request.run_id,
            node_id: request.node_id,
            reason: request.reason,
            severity: request.severity.max(1),
            quorum: request.quorum,
            votes: vec![],
            late_votes: vec![],
            created_at: self.clock.now(),
            sla_deadline: request.sla_deadline,
            default_action: request.default_action,
            resolution: None,
            resolved_at: None,
            escalated_from: request.escalated_from,
        };
        info!(
            run_id = %gate.run_id,
            gate_id = %gate.gate_id,
            node_id = %gate.node_id,
            severity = gate.severity,
            deadline = %gate.sla_deadline,
            "Review gate opened"
        );
        events.push(RunEvent::GateOpened {
            run_id: gate.run_id.clone(),
            gate_id: gate.gate_id.to_string(),
            node_id: gate.node_id.clone(),
            reason: gate.reason,
            severity: gate.severity,
        });
        gate
    }

    /// Record a vote on the gate and report its effect.
    pub fn vote(
        &self,
        gate: &mut GateInstance,
        voter_id: &str,
        decision: VoteDecision,
        events: &mut Vec<RunEvent>,
    ) -> Result<VoteRecord> {
        let role = self.role_of(voter_id)?;
        let now = self.clock.now();
        let vote = Vote {
            voter_id: voter_id.to_string(),
            role,
            decision,
            cast_at: now,
        };

        if !gate.status().is_open() {
            info!(gate_id = %gate.gate_id, voter = voter_id, "Late vote recorded on resolved gate");
            gate.late_votes.push(vote.clone());
            return Ok(VoteRecord {
                vote,
                status: gate.status(),
                resolved_now: false,
                late: true,
            });
        }

        if gate.has_voted(voter_id) {
            return Err(PhasegateError::DuplicateVote {
                gate: gate.gate_id.to_string(),
                voter: voter_id.to_string(),
            });
        }

        gate.votes.push(vote.clone());
        let resolved_now = match gate.evaluate(now) {
            Some(resolution) => {
                settle(gate, resolution, now, events);
                true
            }
            None => false,
        };

        Ok(VoteRecord {
            vote,
            status: gate.status(),
            resolved_now,
            late: false,
        })
    }

    /// Resolve a gate without reviewers. Used when review gates are disabled.
    pub fn bypass(&self, gate: &mut GateInstance, events: &mut Vec<RunEvent>) -> GateStatus {
        let now = self.clock.now();
        if gate.status().is_open() {
            gate.votes.push(Vote {
                voter_id: BYPASS_VOTER.to_string(),
                role: None,
                decision: VoteDecision::Approve,
                cast_at: now,
            });
            settle(gate, GateResolution::Approved, now, events);
        }
        gate.status()
    }

    /// Check the quorum rule, then the SLA deadline.
    pub fn expire(&self, gate: &mut GateInstance, events: &mut Vec<RunEvent>) -> ExpiryRecord {
        let now = self.clock.now();
        if !gate.status().is_open() {
            return ExpiryRecord {
                status: gate.status(),
                resolved_now: false,
                escalated: None,
            };
        }

        // A hold-open window may have elapsed since the last vote.
        if let Some(resolution) = gate.evaluate(now) {
            settle(gate, resolution, now, events);
            return ExpiryRecord {
                status: gate.status(),
                resolved_now: true,
                escalated: None,
            };
        }

        if !gate.is_expired(now) {
            return ExpiryRecord {
                status: GateStatus::Open,
                resolved_now: false,
                escalated: None,
            };
        }

        let mut action = gate.default_action;
        if action == DefaultAction::Escalate && gate.severity >= self.hrg.max_escalation_level {
            warn!(
                gate_id = %gate.gate_id,
                severity = gate.severity,
                "Escalation ceiling reached, paging instead"
            );
            action = DefaultAction::PauseAndPage;
        }

        settle(gate, GateResolution::Defaulted(action), now, events);
        events.push(RunEvent::GateDefaulted {
            run_id: gate.run_id.clone(),
            gate_id: gate.gate_id.to_string(),
            action,
        });

        let message = format!(
            "Gate {} on node '{}' reached its SLA without quorum ({} of {} approvals)",
            gate.gate_id,
            gate.node_id,
            gate.approvals(),
            gate.quorum.min_approvals
        );
        let escalated = match action {
            DefaultAction::PauseAndAlert => {
                events.push(Self::alert(&gate.run_id, message));
                None
            }
            DefaultAction::PauseAndPage => {
                events.push(Self::alert(&gate.run_id, message.clone()));
                events.push(RunEvent::Page {
                    run_id: gate.run_id.clone(),
                    oncall: self.hrg.oncall_path.clone(),
                    message,
                });
                None
            }
            DefaultAction::Escalate => {
                let sla = gate.sla_deadline - gate.created_at;
                let next = self.open(
                    GateRequest {
                        run_id: gate.run_id.clone(),
                        node_id: gate.node_id.clone(),
                        quorum: gate.quorum.clone(),
                        sla_deadline: now + sla,
                        default_action: DefaultAction::Escalate,
                        reason: gate.reason,
                        severity: gate.severity.saturating_add(1),
                        escalated_from: Some(gate.gate_id.clone()),
                    },
                    events,
                );
                Some(next)
            }
        };

        ExpiryRecord {
            status: gate.status(),
            resolved_now: true,
            escalated,
        }
    }

    /// A notification for operators.
    pub fn alert(run_id: &RunId, message: String) -> RunEvent {
        warn!(run_id = %run_id, "{}", message);
        RunEvent::Alert {
            run_id: run_id.clone(),
            message,
        }
    }

    /// Make checkpointed gate states visible. Records the wait of every gate
    /// that resolved since it was last installed.
    pub fn install<'a>(&self, gates: impl IntoIterator<Item = &'a GateInstance>) {
        let now = self.clock.now();
        let mut map = self.write();
        for gate in gates {
            let was_open = map
                .get(&gate.gate_id)
                .map_or(true, |previous| previous.status().is_open());
            if was_open && !gate.status().is_open() {
                self.metrics.record_gate_wait(gate.waited_secs(now));
            }
            map.insert(gate.gate_id.clone(), gate.clone());
        }
    }

    /// Reinstate gates recovered from a snapshot.
    pub fn restore(&self, gates: Vec<GateInstance>) {
        let mut map = self.write();
        for gate in gates {
            map.insert(gate.gate_id.clone(), gate);
        }
    }

    fn role_of(&self, voter_id: &str) -> Result<Option<String>> {
        if voter_id.trim().is_empty() {
            return Err(PhasegateError::UnauthorizedVoter("<empty>".into()));
        }
        if self.hrg.roles.is_empty() {
            return Ok(None);
        }
        self.hrg
            .roles
            .get(voter_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| PhasegateError::UnauthorizedVoter(voter_id.to_string()))
    }

    pub fn get(&self, gate_id: &GateId) -> Option<GateInstance> {
        self.read().get(gate_id).cloned()
    }

    /// Every gate of a run, oldest first.
    pub fn for_run(&self, run_id: &RunId) -> Vec<GateInstance> {
        let mut gates: Vec<GateInstance> = self
            .read()
            .values()
            .filter(|g| &g.run_id == run_id)
            .cloned()
            .collect();
        gates.sort_by_key(|g| g.created_at);
        gates
    }

    /// Open gates, optionally restricted to one run.
    pub fn open_gates(&self, run_id: Option<&RunId>) -> Vec<GateInstance> {
        let mut gates: Vec<GateInstance> = self
            .read()
            .values()
            .filter(|g| g.status().is_open() && run_id.map_or(true, |r| &g.run_id == r))
            .cloned()
            .collect();
        gates.sort_by_key(|g| g.created_at);
        gates
    }

    /// Find a gate by prefix match on its id.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<GateId> {
        let gates = self.read();
        let mut matches = gates.keys().filter(|id| id.0.starts_with(prefix));
        let first = matches.next()?.clone();
        // Ambiguous prefixes resolve to nothing.
        matches.next().is_none().then_some(first)
    }
}

fn settle(
    gate: &mut GateInstance,
    resolution: GateResolution,
    now: DateTime<Utc>,
    events: &mut Vec<RunEvent>,
) {
    gate.resolution = Some(resolution);
    gate.resolved_at = Some(now);
    let waited_secs = gate.waited_secs(now);
    info!(
        run_id = %gate.run_id,
        gate_id = %gate.gate_id,
        resolution = ?resolution,
        waited_secs,
        "Review gate resolved"
    );
    events.push(RunEvent::GateResolved {
        run_id: gate.run_id.clone(),
        gate_id: gate.gate_id.to_string(),
        resolution,
        waited_secs,
    });
}
