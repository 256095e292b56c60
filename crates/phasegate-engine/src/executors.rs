use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use phasegate_core::error::{PhasegateError, Result};
use phasegate_core::traits::Executor;
use phasegate_core::types::{ExecutorFailure, TaskContract, TaskResult};

/// Registry of executors available to automated nodes.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `noop` and `command` executors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NoopExecutor);
        registry.register(CommandExecutor);
        registry
    }

    pub fn register(&mut self, executor: impl Executor) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| PhasegateError::ExecutorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn param_cost(params: &serde_json::Value) -> f64 {
    params.get("cost").and_then(|c| c.as_f64()).unwrap_or(0.0)
}

/// Succeeds immediately, echoing the node params and charging `params.cost`.
pub struct NoopExecutor;

impl Executor for NoopExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    fn execute(&self, task: TaskContract) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let cost = param_cost(&task.params);
            Ok(TaskResult::success(task.params, cost))
        })
    }
}

#[derive(Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Runs a child process per attempt.
///
/// The task contract is written to stdin as JSON. Stdout is parsed as a
/// result contract when it has a `status` field, otherwise as the output
/// payload (plain text if it is not JSON). A non-zero exit is a failure
/// carrying stderr. The child is killed if the attempt is abandoned.
pub struct CommandExecutor;

impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    fn execute(&self, task: TaskContract) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let params: CommandParams = serde_json::from_value(task.params.clone())
                .map_err(|e| PhasegateError::Executor(format!("invalid command params: {}", e)))?;
            let cost = param_cost(&task.params);

            debug!(node_id = %task.node_id, program = %params.program, "Spawning command executor");

            let mut cmd = tokio::process::Command::new(&params.program);
            cmd.args(&params.args);
            if let Some(cwd) = &params.cwd {
                cmd.current_dir(cwd);
            }
            cmd.envs(&params.env);
            cmd.env("PHASEGATE_RUN_ID", task.run_id.as_str());
            cmd.env("PHASEGATE_NODE_ID", &task.node_id);
            cmd.env("PHASEGATE_ATTEMPT", task.attempt.to_string());
            cmd.stdin(std::process::Stdio::piped());
            cmd.stdout(std::process::Stdio::piped());
            cmd.stderr(std::process::Stdio::piped());
            cmd.kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| {
                PhasegateError::Executor(format!("failed to spawn {}: {}", params.program, e))
            })?;

            // Feed the contract while draining stdout and stderr, so a child
            // that writes before it reads cannot fill its pipe and stall.
            let body = serde_json::to_vec(&task)?;
            let stdin = child.stdin.take();
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    use tokio::io::AsyncWriteExt;
                    // A child that never reads stdin is not an error.
                    let _ = stdin.write_all(&body).await;
                }
            };
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            let output = output
                .map_err(|e| PhasegateError::Executor(format!("failed to wait for child: {}", e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Ok(TaskResult::failure(
                    ExecutorFailure::new(
                        "exit_status",
                        format!(
                            "exit {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                    ),
                    cost,
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                return Ok(TaskResult::success(serde_json::Value::Null, cost));
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) if value.get("status").is_some() => {
                    serde_json::from_value::<TaskResult>(value.clone())
                        .or_else(|_| Ok(TaskResult::success(value, cost)))
                }
                Ok(value) => Ok(TaskResult::success(value, cost)),
                Err(_) => Ok(TaskResult::success(
                    serde_json::Value::String(trimmed.to_string()),
                    cost,
                )),
            }
        })
    }
}
