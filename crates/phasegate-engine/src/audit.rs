use std::sync::Arc;

use serde::{Deserialize, Serialize};

use phasegate_core::error::Result;
use phasegate_core::types::RunId;

use crate::checkpoint::{ChainReport, CheckpointStore, GENESIS_HASH};
use crate::state::RunSnapshot;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RunStarted,
    RunRecovered,
    NodeDispatched,
    NodeCompleted,
    NodeRetryScheduled,
    NodeSkipped,
    RetryEdgeFired,
    GateCreated,
    GateBypassed,
    VoteCast,
    LateVote,
    GateResolved,
    GateDefaulted,
    GateEscalated,
    BudgetBreach,
    RunPaused,
    RunResumed,
    KillSwitch,
    LoopLimitExceeded,
    RunFailed,
    RunFinished,
}

impl AuditKind {
    /// Kinds that record a fatal condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LoopLimitExceeded | Self::RunFailed | Self::KillSwitch)
    }
}

/// An event to append. The store assigns sequence, chain hashes, and the
/// checkpoint it belongs to.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub run_id: RunId,
    pub node_id: Option<String>,
    pub attempt: Option<u32>,
    pub kind: AuditKind,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(run_id: &RunId, kind: AuditKind) -> Self {
        Self {
            run_id: run_id.clone(),
            node_id: None,
            attempt: None,
            kind,
            detail: serde_json::Value::Null,
        }
    }

    /// Attribute the event to one node-execution attempt.
    pub fn for_attempt(mut self, node_id: impl Into<String>, attempt: u32) -> Self {
        self.node_id = Some(node_id.into());
        self.attempt = Some(attempt);
        self
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// One line of `audit.jsonl`. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    pub seq: u64,
    pub run_id: RunId,
    /// Sequence number of the checkpoint this entry belongs to.
    pub checkpoint_seq: u64,
    pub node_id: Option<String>,
    pub attempt: Option<u32>,
    pub kind: AuditKind,
    pub detail: serde_json::Value,
    pub timestamp: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Hash over every field except `hash` itself.
    pub fn compute_hash(&self) -> String {
        let kind = serde_json::to_string(&self.kind).unwrap_or_default();
        let detail = serde_json::to_string(&self.detail).unwrap_or_default();
        let input = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.seq,
            self.run_id,
            self.checkpoint_seq,
            self.node_id.as_deref().unwrap_or(""),
            self.attempt.map(|a| a.to_string()).unwrap_or_default(),
            kind,
            detail,
            self.timestamp,
            self.prev_hash,
        );
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }
}

/// Filter for audit queries. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub kind: Option<AuditKind>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub since_seq: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.kind.map_or(true, |k| entry.kind == k)
            && self
                .node_id
                .as_deref()
                .map_or(true, |n| entry.node_id.as_deref() == Some(n))
            && self.since_seq.map_or(true, |s| entry.seq >= s)
    }
}

/// Verify an `audit.jsonl` body without an orchestrator.
pub fn verify_audit_lines(text: &str) -> ChainReport {
    let mut report = ChainReport::empty();
    let mut prev_hash = GENESIS_HASH.to_string();

    for (i, line) in text.lines().enumerate() {
        let expected_seq = i as u64 + 1;
        let entry: AuditEntry = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => return report.fail(expected_seq, format!("unparseable entry: {}", e)),
        };
        if entry.seq != expected_seq {
            return report.fail(
                expected_seq,
                format!("sequence gap: expected {}, found {}", expected_seq, entry.seq),
            );
        }
        if entry.prev_hash != prev_hash {
            return report.fail(expected_seq, "broken chain link".into());
        }
        if entry.compute_hash() != entry.hash {
            return report.fail(expected_seq, "entry hash mismatch".into());
        }
        prev_hash = entry.hash;
        report.checked = expected_seq;
    }

    report.head_hash = (report.checked > 0).then_some(prev_hash);
    report
}

/// Read-only view of the ledger for external consumers such as reporting
/// or meta-analysis. Exposes no write path.
#[derive(Clone)]
pub struct AuditReader {
    store: Arc<CheckpointStore>,
}

impl AuditReader {
    pub fn new(store: Arc<CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        self.store.list_runs()
    }

    pub fn query(&self, run_id: &RunId, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store.query_audit(run_id, filter)
    }

    pub fn latest_snapshot(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        self.store.load_latest(run_id)
    }

    pub fn verify(&self, run_id: &RunId) -> Result<ChainReport> {
        self.store.verify_chain(run_id)
    }

    pub fn verify_audit(&self, run_id: &RunId) -> Result<ChainReport> {
        self.store.verify_audit(run_id)
    }
}
