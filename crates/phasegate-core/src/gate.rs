use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GateId, RunId};

/// What a reviewer decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    /// Approve with an amendment merged into the run context on approval.
    Modify { amendment: serde_json::Value },
}

impl VoteDecision {
    /// Parse a CLI/HTTP decision word. `modify` requires an amendment payload.
    pub fn parse(word: &str, amendment: Option<serde_json::Value>) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" => Some(Self::Approve),
            "reject" | "rejected" | "no" => Some(Self::Reject),
            "modify" => Some(Self::Modify {
                amendment: amendment.unwrap_or(serde_json::Value::Null),
            }),
            _ => None,
        }
    }

    /// Approvals and modifications both count toward the approval quorum.
    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approve | Self::Modify { .. })
    }
}

/// A single vote cast on a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    #[serde(default)]
    pub role: Option<String>,
    pub decision: VoteDecision,
    pub cast_at: DateTime<Utc>,
}

/// How many rejections resolve a gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Any single rejection is decisive.
    #[default]
    Decisive,
    /// Rejection needs this many reject votes.
    Quorum(u32),
}

/// Quorum rule for a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumSpec {
    /// Approving votes needed.
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    /// Each listed role must be represented among the approving voters.
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// Approval only takes effect once the gate has been open this long
    /// with no rejection on record.
    #[serde(default)]
    pub hold_open_secs: Option<u64>,
    #[serde(default)]
    pub rejection: RejectionPolicy,
}

fn default_min_approvals() -> u32 {
    1
}

impl Default for QuorumSpec {
    fn default() -> Self {
        Self {
            min_approvals: default_min_approvals(),
            required_roles: vec![],
            hold_open_secs: None,
            rejection: RejectionPolicy::default(),
        }
    }
}

impl QuorumSpec {
    pub fn approvals(n: u32) -> Self {
        Self {
            min_approvals: n,
            ..Default::default()
        }
    }
}

/// Action taken when a gate's SLA elapses without resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    /// Keep the run paused and raise a notification.
    #[default]
    PauseAndAlert,
    /// Keep the run paused, raise a notification, and page on-call.
    PauseAndPage,
    /// Open a new, higher-severity gate on the same node.
    Escalate,
}

impl std::fmt::Display for DefaultAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PauseAndAlert => "pause_and_alert",
            Self::PauseAndPage => "pause_and_page",
            Self::Escalate => "escalate",
        };
        write!(f, "{}", s)
    }
}

/// Why a gate exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    /// The orchestrator reached a gate node.
    #[default]
    NodeReached,
    /// Cost cap exceeded.
    BudgetBreach,
    /// Run wall-clock cap exceeded.
    TtlBreach,
    /// Kill-switch signal raised for review instead of immediate termination.
    KillSignal,
}

/// Final outcome of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResolution {
    Approved,
    Rejected,
    Defaulted(DefaultAction),
}

/// Current state of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Open,
    Resolved(GateResolution),
}

impl GateStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// A blocking approval checkpoint on one node of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateInstance {
    pub gate_id: GateId,
    pub run_id: RunId,
    pub node_id: String,
    #[serde(default)]
    pub reason: GateReason,
    /// Starts at 1; each escalation adds one.
    pub severity: u8,
    pub quorum: QuorumSpec,
    #[serde(default)]
    pub votes: Vec<Vote>,
    /// Votes that arrived after resolution. Recorded, never counted.
    #[serde(default)]
    pub late_votes: Vec<Vote>,
    pub created_at: DateTime<Utc>,
    pub sla_deadline: DateTime<Utc>,
    pub default_action: DefaultAction,
    #[serde(default)]
    pub resolution: Option<GateResolution>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalated_from: Option<GateId>,
}

impl GateInstance {
    pub fn status(&self) -> GateStatus {
        match self.resolution {
            Some(r) => GateStatus::Resolved(r),
            None => GateStatus::Open,
        }
    }

    pub fn approvals(&self) -> u32 {
        self.votes.iter().filter(|v| v.decision.is_approval()).count() as u32
    }

    pub fn rejections(&self) -> u32 {
        self.votes
            .iter()
            .filter(|v| matches!(v.decision, VoteDecision::Reject))
            .count() as u32
    }

    pub fn has_voted(&self, voter_id: &str) -> bool {
        self.votes.iter().any(|v| v.voter_id == voter_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.sla_deadline
    }

    /// Amendments carried by `modify` votes, in vote order.
    pub fn amendments(&self) -> Vec<&serde_json::Value> {
        self.votes
            .iter()
            .filter_map(|v| match &v.decision {
                VoteDecision::Modify { amendment } if !amendment.is_null() => Some(amendment),
                _ => None,
            })
            .collect()
    }

    /// Evaluate the quorum rule at `now`. Does not consider the SLA deadline.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Option<GateResolution> {
        let rejections = self.rejections();
        let rejected = match self.quorum.rejection {
            RejectionPolicy::Decisive => rejections >= 1,
            RejectionPolicy::Quorum(n) => rejections >= n.max(1),
        };
        if rejected {
            return Some(GateResolution::Rejected);
        }

        if self.approvals() < self.quorum.min_approvals {
            return None;
        }

        let roles_met = self.quorum.required_roles.iter().all(|role| {
            self.votes
                .iter()
                .any(|v| v.decision.is_approval() && v.role.as_deref() == Some(role.as_str()))
        });
        if !roles_met {
            return None;
        }

        if let Some(hold) = self.quorum.hold_open_secs {
            let held = now - self.created_at >= crate::clock::seconds(hold);
            if !held || rejections > 0 {
                return None;
            }
        }

        Some(GateResolution::Approved)
    }

    /// Seconds between opening and resolution (or `now` if still open).
    pub fn waited_secs(&self, now: DateTime<Utc>) -> u64 {
        let end = self.resolved_at.unwrap_or(now);
        (end - self.created_at).num_seconds().max(0) as u64
    }
}
