pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod executors;
pub mod gate;
pub mod graph;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod state;

pub use audit::{AuditEntry, AuditEvent, AuditFilter, AuditKind, AuditReader};
pub use budget::{BudgetBreach, BudgetGuard, BudgetScope, BudgetSnapshot};
pub use checkpoint::{ChainReport, CheckpointRecord, CheckpointStore};
pub use executors::{CommandExecutor, ExecutorRegistry, NoopExecutor};
pub use gate::{GateRequest, GateSubsystem};
pub use graph::{DagDefinition, Edge, EdgeCondition, EdgeKind, GateSpec, NodeKind, PhaseNode, RunContext};
pub use orchestrator::{NodeView, Orchestrator, OrchestratorBuilder, RunView};
pub use pool::WorkerPool;
pub use state::{NodeState, RunSnapshot};
