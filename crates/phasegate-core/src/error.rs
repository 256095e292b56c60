use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhasegateError {
    // Node execution errors
    #[error("Node execution failed: {node} (attempt {attempt}): {message}")]
    NodeExecution {
        node: String,
        attempt: u32,
        message: String,
    },

    #[error("Node timeout after {timeout_secs}s: {node} (attempt {attempt})")]
    NodeTimeout {
        node: String,
        attempt: u32,
        timeout_secs: u64,
    },

    #[error("Executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("Executor error: {0}")]
    Executor(String),

    // Gate errors
    #[error("Gate SLA elapsed without quorum: {gate}")]
    GateTimeout { gate: String },

    #[error("Gate not found: {0}")]
    GateNotFound(String),

    #[error("Voter {voter} already voted on gate {gate}")]
    DuplicateVote { gate: String, voter: String },

    #[error("Voter not authorized for review gates: {0}")]
    UnauthorizedVoter(String),

    // Budget errors
    #[error("Budget breach ({scope}): consumed {consumed:.2} of cap {cap:.2}")]
    BudgetBreach {
        scope: String,
        consumed: f64,
        cap: f64,
    },

    // Ledger errors
    #[error("Checkpoint chain integrity failure for run {run} at seq {seq}: {reason}")]
    ChainIntegrity {
        run: String,
        seq: u64,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Run {run} is locked by another writer: {lock}")]
    RunLocked { run: String, lock: String },

    // Run errors
    #[error("Retry loop limit exceeded on edge {edge} (max {max_iterations})")]
    LoopLimitExceeded { edge: String, max_iterations: u32 },

    #[error("Invalid DAG definition: {0}")]
    InvalidDefinition(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run id '{0}': expected letters, digits, '-' or '_'")]
    InvalidRunId(String),

    #[error("Run {run} cannot {action} while {status}")]
    InvalidTransition {
        run: String,
        action: String,
        status: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhasegateError {
    /// Fatal errors end a run (or block its recovery) without further automated handling.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChainIntegrity { .. } | Self::LoopLimitExceeded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PhasegateError>;
