//! DAG definitions: phase nodes, edges, the validator, and the accumulated
//! run context that flows between nodes.
//!
//! The forward subgraph must be acyclic. Retry edges are the only way back
//! to an earlier node, and each declares its own iteration bound.

pub mod context;
pub mod definition;
pub mod edge;
pub mod node;

pub use context::RunContext;
pub use definition::DagDefinition;
pub use edge::{evaluate_condition, Edge, EdgeCondition, EdgeKind};
pub use node::{GateSpec, NodeKind, PhaseNode};
