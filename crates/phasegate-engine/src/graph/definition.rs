use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use phasegate_core::clock::MAX_DURATION_SECS;
use phasegate_core::error::{PhasegateError, Result};

use super::edge::{Edge, EdgeKind};
use super::node::PhaseNode;

/// A DAG of phase nodes. Shared read-only by every run started from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<PhaseNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Free-form data carried into snapshots (owner, target, pinned policy docs...).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DagDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            nodes: vec![],
            edges: vec![],
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: PhaseNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PhasegateError::InvalidDefinition(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| PhasegateError::InvalidDefinition(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&PhaseNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Forward edges arriving at `id`.
    pub fn incoming_forward<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id && !e.is_retry())
    }

    /// All edges leaving `id`, retry edges included.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Nodes with no incoming forward edge.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.incoming_forward(&n.id).next().is_none())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Every node reachable from `id` over forward edges, excluding `id`.
    pub fn forward_descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.from == current && !e.is_retry()) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(&edge.to);
                }
            }
        }
        seen.remove(id);
        seen
    }

    /// Topological order of the forward subgraph (Kahn's algorithm), stable
    /// with respect to declaration order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in self.edges.iter().filter(|e| !e.is_retry()) {
            if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for edge in self.edges.iter().filter(|e| e.from == id && !e.is_retry()) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(&edge.to);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cyclic: Vec<&str> = self
                .nodes
                .iter()
                .map(|n| n.id.as_str())
                .filter(|id| in_degree.get(id).is_some_and(|d| *d > 0))
                .collect();
            return Err(PhasegateError::InvalidDefinition(format!(
                "cycle outside retry edges involving: {}",
                cyclic.join(", ")
            )));
        }
        Ok(order)
    }

    /// Reject definitions the orchestrator cannot drive to termination.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PhasegateError::InvalidDefinition(msg));

        if self.nodes.is_empty() {
            return invalid(format!("definition '{}' has no nodes", self.id));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return invalid("node with empty id".into());
            }
            if !ids.insert(node.id.as_str()) {
                return invalid(format!("duplicate node id '{}'", node.id));
            }
            if node.is_gate() && node.gate.is_none() {
                return invalid(format!("gate node '{}' has no gate spec", node.id));
            }
            if let Some(gate) = &node.gate {
                if gate.min_approvals == 0 {
                    return invalid(format!("gate '{}' must require at least one approval", node.id));
                }
            }
            let windows = [
                ("timeout_secs", node.timeout_secs),
                ("sla_secs", node.gate.as_ref().and_then(|g| g.sla_secs)),
                ("hold_open_secs", node.gate.as_ref().and_then(|g| g.hold_open_secs)),
            ];
            for (field, secs) in windows {
                if let Some(secs) = secs.filter(|s| *s > MAX_DURATION_SECS) {
                    return invalid(format!(
                        "node '{}' {} {} exceeds the {}s limit",
                        node.id, field, secs, MAX_DURATION_SECS
                    ));
                }
            }
            if let Some(retry) = &node.retry {
                if retry.max_attempts == 0 {
                    return invalid(format!("node '{}' allows zero attempts", node.id));
                }
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return invalid(format!("edge {} references unknown node '{}'", edge.label(), end));
                }
            }
            if !edge.is_retry() && edge.from == edge.to {
                return invalid(format!("forward edge {} loops onto itself", edge.label()));
            }
        }

        self.topological_order()?;

        for edge in &self.edges {
            let EdgeKind::Retry { max_iterations } = edge.kind else {
                continue;
            };
            if max_iterations == 0 {
                return invalid(format!(
                    "retry edge {} must declare max_iterations >= 1",
                    edge.label()
                ));
            }
            let is_ancestor =
                edge.to == edge.from || self.forward_descendants(&edge.to).contains(&edge.from);
            if !is_ancestor {
                return invalid(format!(
                    "retry edge {} must target an ancestor of its source",
                    edge.label()
                ));
            }
        }

        if self.entry_nodes().is_empty() {
            return invalid("no entry node".into());
        }
        Ok(())
    }

    /// Hex BLAKE3 hash of the canonical JSON form, recorded in run snapshots.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}
