use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PhasegateError, Result};
use crate::gate::{DefaultAction, GateReason, GateResolution};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a trusted id. External input goes through [`RunId::parse`].
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Parse an id supplied by a caller. Run ids name directories in the
    /// store, so only ASCII letters, digits, `-` and `_` are accepted.
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        if id.is_valid() {
            Ok(id)
        } else {
            Err(PhasegateError::InvalidRunId(s.to_string()))
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_RUN_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

const MAX_RUN_ID_LEN: usize = 128;

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique review gate identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(pub String);

impl GateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for GateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Killed,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal runs never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Killed | Self::Completed | Self::Failed)
    }

    /// Process exit status communicating this run state.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed => 1,
            Self::Killed => 2,
            Self::Paused | Self::Running => 3,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Killed => "killed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single node execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// Structured error returned by an executor on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorFailure {
    pub kind: String,
    pub message: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl ExecutorFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new("timeout", format!("no result within {}s", timeout_secs))
    }

    pub fn killed() -> Self {
        Self {
            kind: "killed".into(),
            message: "run killed while execution was in flight".into(),
            retryable: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: "cancelled".into(),
            message: "run finished while execution was in flight".into(),
            retryable: false,
        }
    }
}

/// One attempt at executing one node. Immutable once closed; a retry
/// creates a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub run_id: RunId,
    pub node_id: String,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub error: Option<ExecutorFailure>,
}

impl NodeExecution {
    /// Open a new execution in the `running` state.
    pub fn dispatched(run_id: RunId, node_id: impl Into<String>, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            attempt,
            status: ExecutionStatus::Running,
            started_at: at,
            ended_at: None,
            output: None,
            cost: 0.0,
            error: None,
        }
    }

    /// Close the execution. Returns `false` (and changes nothing) if it was already closed.
    pub fn close(
        &mut self,
        status: ExecutionStatus,
        at: DateTime<Utc>,
        output: Option<serde_json::Value>,
        cost: f64,
        error: Option<ExecutorFailure>,
    ) -> bool {
        if self.status.is_closed() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(at);
        self.output = output;
        self.cost = cost;
        self.error = error;
        true
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Task contract handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContract {
    pub run_id: RunId,
    pub node_id: String,
    pub attempt: u32,
    /// Accumulated run context visible to this node.
    pub context: HashMap<String, serde_json::Value>,
    /// Node-specific executor parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub deadline: DateTime<Utc>,
}

/// Outcome reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// Result contract returned by an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskOutcome,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub error: Option<ExecutorFailure>,
}

impl TaskResult {
    pub fn success(output: serde_json::Value, cost: f64) -> Self {
        Self {
            status: TaskOutcome::Succeeded,
            output,
            cost,
            error: None,
        }
    }

    pub fn failure(error: ExecutorFailure, cost: f64) -> Self {
        Self {
            status: TaskOutcome::Failed,
            output: serde_json::Value::Null,
            cost,
            error: Some(error),
        }
    }
}

/// Run event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run was created.
    RunStarted { run_id: RunId },
    /// A node attempt was handed to the worker pool.
    NodeDispatched { run_id: RunId, node_id: String, attempt: u32 },
    /// A node attempt closed.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        status: ExecutionStatus,
        elapsed_ms: u64,
    },
    /// A review gate opened.
    GateOpened {
        run_id: RunId,
        gate_id: String,
        node_id: String,
        reason: GateReason,
        severity: u8,
    },
    /// A review gate resolved.
    GateResolved {
        run_id: RunId,
        gate_id: String,
        resolution: GateResolution,
        waited_secs: u64,
    },
    /// Notification raised by a `pause_and_alert` default action or a stuck run.
    Alert { run_id: RunId, message: String },
    /// On-call page raised by a `pause_and_page` default action.
    Page { run_id: RunId, oncall: Option<String>, message: String },
    /// Budget cap exceeded.
    BudgetBreach { run_id: RunId, scope: String, consumed: f64, cap: f64 },
    RunPaused { run_id: RunId },
    RunResumed { run_id: RunId },
    RunKilled { run_id: RunId, in_flight: usize },
    /// The run reached a terminal status.
    RunFinished { run_id: RunId, status: RunStatus },
    /// A default action fired on an expired gate.
    GateDefaulted { run_id: RunId, gate_id: String, action: DefaultAction },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_terminal_states() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Killed.exit_code(), 2);
        assert_eq!(RunStatus::Paused.exit_code(), 3);
        assert!(RunStatus::Killed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn closed_execution_is_immutable() {
        let now = Utc::now();
        let mut exec = NodeExecution::dispatched(RunId::from_string("r1"), "ingest", 1, now);
        assert!(exec.close(ExecutionStatus::Succeeded, now, None, 2.5, None));
        assert!(!exec.close(
            ExecutionStatus::Failed,
            now,
            None,
            9.0,
            Some(ExecutorFailure::new("late", "should be ignored"))
        ));
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(exec.cost, 2.5);
        assert!(exec.error.is_none());
    }

    #[test]
    fn run_id_parse_rejects_path_components() {
        assert!(RunId::parse(&RunId::new().0).is_ok());
        assert!(RunId::parse("nightly_build-7").is_ok());
        for bad in ["", "..", "../other", "a/b", "a\\b", "/etc", "run 1", "r\u{e9}"] {
            assert!(
                matches!(RunId::parse(bad), Err(PhasegateError::InvalidRunId(_))),
                "accepted {bad:?}"
            );
        }
        assert!(RunId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn run_id_serializes_transparently() {
        let id = RunId::from_string("run-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"run-42\"");
    }
}
