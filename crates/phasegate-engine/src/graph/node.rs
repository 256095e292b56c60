use serde::{Deserialize, Serialize};

use phasegate_core::config::RetryConfig;
use phasegate_core::gate::{DefaultAction, QuorumSpec, RejectionPolicy};

/// Whether a node runs through an executor or blocks on human review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Automated,
    Gate,
}

/// Review requirements of a gate node. Unset fields fall back to `[hrg]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub hold_open_secs: Option<u64>,
    #[serde(default)]
    pub rejection: Option<RejectionPolicy>,
    #[serde(default)]
    pub sla_secs: Option<u64>,
    #[serde(default)]
    pub default_action: Option<DefaultAction>,
}

fn default_min_approvals() -> u32 {
    1
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            min_approvals: default_min_approvals(),
            required_roles: vec![],
            hold_open_secs: None,
            rejection: None,
            sla_secs: None,
            default_action: None,
        }
    }
}

impl GateSpec {
    pub fn approvals(n: u32) -> Self {
        Self {
            min_approvals: n,
            ..Default::default()
        }
    }

    /// Quorum rule with the configured rejection policy as fallback.
    pub fn quorum(&self, default_rejection: &RejectionPolicy) -> QuorumSpec {
        QuorumSpec {
            min_approvals: self.min_approvals,
            required_roles: self.required_roles.clone(),
            hold_open_secs: self.hold_open_secs,
            rejection: self
                .rejection
                .clone()
                .unwrap_or_else(|| default_rejection.clone()),
        }
    }
}

/// A phase in the DAG. Immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Registered executor name. Ignored for gate nodes.
    #[serde(default = "default_executor")]
    pub executor: String,
    /// Executor-specific parameters, passed through opaquely.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-attempt timeout; falls back to `orchestration.default_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Per-node retry policy; falls back to `[retry]`.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Cost reserved against the budget before dispatch.
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Keys copied from the node's output object into the run context.
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default)]
    pub gate: Option<GateSpec>,
}

fn default_executor() -> String {
    "noop".to_string()
}

impl PhaseNode {
    /// Create an automated node.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Automated,
            executor: default_executor(),
            params: serde_json::Value::Null,
            timeout_secs: None,
            retry: None,
            estimated_cost: 0.0,
            capabilities: vec![],
            output_keys: vec![],
            gate: None,
        }
    }

    /// Create a gate node.
    pub fn gate(id: impl Into<String>, name: impl Into<String>, spec: GateSpec) -> Self {
        Self {
            kind: NodeKind::Gate,
            gate: Some(spec),
            ..Self::new(id, name)
        }
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Shorthand for a retry policy that only changes the attempt count.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        let mut retry = self.retry.take().unwrap_or_default();
        retry.max_attempts = max_attempts;
        self.retry = Some(retry);
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    pub fn is_gate(&self) -> bool {
        self.kind == NodeKind::Gate
    }
}
