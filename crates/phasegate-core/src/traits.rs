use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{TaskContract, TaskResult};

/// Opaque runner for automated nodes.
///
/// The orchestrator never assumes synchronous completion: every call is
/// raced against the node timeout and the run's kill-switch, and a future
/// that loses that race is dropped without cooperation from the executor.
pub trait Executor: Send + Sync + 'static {
    /// Executor name referenced by `PhaseNode::executor`.
    fn name(&self) -> &str;

    /// Run one attempt of one node.
    ///
    /// `Err` is treated as a retryable node execution failure; a
    /// `TaskResult` with `TaskOutcome::Failed` carries a structured error.
    fn execute(&self, task: TaskContract) -> BoxFuture<'_, Result<TaskResult>>;
}
