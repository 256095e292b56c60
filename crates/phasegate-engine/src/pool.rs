use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use phasegate_core::metrics::Metrics;
use phasegate_core::traits::Executor;
use phasegate_core::types::{TaskContract, TaskResult};

/// One node attempt handed to the pool.
pub struct Dispatch {
    pub executor: Arc<dyn Executor>,
    pub contract: TaskContract,
    pub timeout: Duration,
    /// Retry backoff served before the attempt starts.
    pub delay: Duration,
}

/// How an attempt ended, as seen by the worker.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// The executor returned a result contract.
    Finished(TaskResult),
    /// The executor call itself errored.
    Errored(String),
    /// No result within the node timeout.
    TimedOut { timeout_secs: u64 },
    /// The run was killed or finished before the attempt did.
    Killed,
}

/// Completion report sent to the run's coordinator.
#[derive(Debug, Clone)]
pub struct Completion {
    pub node_id: String,
    pub attempt: u32,
    pub outcome: CompletionOutcome,
    pub elapsed_ms: u64,
}

/// Bounded pool of node workers for one run.
///
/// Each dispatched attempt becomes a task that serves its backoff, waits for
/// a permit, then races the executor against the node timeout and the
/// run's stop token. Every worker reports on the same channel, which the
/// coordinator drains in completion order.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    stop: CancellationToken,
    tx: mpsc::UnboundedSender<Completion>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    /// Create a pool with `width` permits and its completion channel.
    pub fn new(
        width: usize,
        stop: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            permits: Arc::new(Semaphore::new(width.max(1))),
            stop,
            tx,
            metrics,
        };
        (pool, rx)
    }

    pub fn spawn(&self, dispatch: Dispatch) {
        let permits = self.permits.clone();
        let stop = self.stop.clone();
        let tx = self.tx.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let node_id = dispatch.contract.node_id.clone();
            let attempt = dispatch.contract.attempt;
            let start = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => CompletionOutcome::Killed,
                outcome = run_attempt(dispatch, permits, metrics) => outcome,
            };

            debug!(node_id = %node_id, attempt, outcome = ?outcome, "Worker finished");
            let report = Completion {
                node_id,
                attempt,
                outcome,
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            if tx.send(report).is_err() {
                warn!("Completion channel closed, dropping worker report");
            }
        });
    }
}

async fn run_attempt(
    dispatch: Dispatch,
    permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
) -> CompletionOutcome {
    // Backoff is served without a permit so waiting retries do not starve
    // ready siblings.
    if !dispatch.delay.is_zero() {
        tokio::time::sleep(dispatch.delay).await;
    }
    let Ok(_permit) = permits.acquire_owned().await else {
        return CompletionOutcome::Killed;
    };

    metrics.record_invocation();
    let timeout_secs = dispatch.timeout.as_secs();
    match tokio::time::timeout(dispatch.timeout, dispatch.executor.execute(dispatch.contract)).await {
        Ok(Ok(result)) => CompletionOutcome::Finished(result),
        Ok(Err(e)) => CompletionOutcome::Errored(e.to_string()),
        Err(_) => CompletionOutcome::TimedOut { timeout_secs },
    }
}
