use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use phasegate_core::clock::Clock;
use phasegate_core::error::{PhasegateError, Result};
use phasegate_core::metrics::Metrics;
use phasegate_core::types::RunId;

use crate::audit::{verify_audit_lines, AuditEntry, AuditEvent, AuditFilter};
use crate::graph::DagDefinition;
use crate::state::RunSnapshot;

/// `prev_hash` of the first record in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const CHECKPOINTS_FILE: &str = "checkpoints.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";
const DEFINITION_FILE: &str = "definition.json";
const WRITER_LOCK_FILE: &str = "writer.lock";

/// One line of `checkpoints.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecord {
    pub seq: u64,
    pub run_id: RunId,
    pub timestamp: String,
    /// Serialized `RunSnapshot`, kept as text so hashes are over exact bytes.
    pub snapshot: String,
    pub snapshot_hash: String,
    pub prev_hash: String,
    pub hash: String,
}

impl CheckpointRecord {
    pub fn compute_hash(&self) -> String {
        let input = format!(
            "{}|{}|{}|{}|{}",
            self.seq, self.run_id, self.timestamp, self.prev_hash, self.snapshot
        );
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }
}

/// Outcome of recomputing a hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub valid: bool,
    /// Records verified before the first failure.
    pub checked: u64,
    pub first_invalid_seq: Option<u64>,
    pub reason: Option<String>,
    pub head_hash: Option<String>,
}

impl ChainReport {
    pub(crate) fn empty() -> Self {
        Self {
            valid: true,
            checked: 0,
            first_invalid_seq: None,
            reason: None,
            head_hash: None,
        }
    }

    pub(crate) fn fail(mut self, seq: u64, reason: String) -> Self {
        self.valid = false;
        self.first_invalid_seq = Some(seq);
        self.reason = Some(reason);
        self.head_hash = None;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Convert a failed report into the fatal error for `run_id`.
    pub fn into_result(self, run_id: &RunId) -> Result<Self> {
        if self.valid {
            return Ok(self);
        }
        Err(PhasegateError::ChainIntegrity {
            run: run_id.to_string(),
            seq: self.first_invalid_seq.unwrap_or_default(),
            reason: self.reason.unwrap_or_default(),
        })
    }
}

/// Verify a `checkpoints.jsonl` body. Stops at the first bad record.
pub fn verify_lines(text: &str) -> ChainReport {
    let mut report = ChainReport::empty();
    let mut prev_hash = GENESIS_HASH.to_string();

    for (i, line) in text.lines().enumerate() {
        let expected_seq = i as u64 + 1;
        let record: CheckpointRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return report.fail(expected_seq, format!("unparseable record: {}", e)),
        };
        if record.seq != expected_seq {
            return report.fail(
                expected_seq,
                format!("sequence gap: expected {}, found {}", expected_seq, record.seq),
            );
        }
        if record.prev_hash != prev_hash {
            return report.fail(expected_seq, "broken chain link".into());
        }
        if blake3::hash(record.snapshot.as_bytes()).to_hex().as_str() != record.snapshot_hash {
            return report.fail(expected_seq, "snapshot hash mismatch".into());
        }
        if record.compute_hash() != record.hash {
            return report.fail(expected_seq, "record hash mismatch".into());
        }
        prev_hash = record.hash;
        report.checked = expected_seq;
    }

    report.head_hash = (report.checked > 0).then_some(prev_hash);
    report
}

/// Verify a checkpoint file on disk.
pub fn verify_file(path: &Path) -> Result<ChainReport> {
    let bytes = std::fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => verify_lines(&text),
        Err(_) => ChainReport::empty().fail(1, "file is not valid UTF-8".into()),
    })
}

#[derive(Debug, Default)]
struct RunIndex {
    head_seq: u64,
    head_hash: String,
    audit_seq: u64,
    audit_hash: String,
    latest: Option<RunSnapshot>,
}

/// Append-only, hash-chained ledger of run checkpoints and audit entries.
///
/// Layout: `<dir>/<run_id>/{definition.json, checkpoints.jsonl, audit.jsonl, writer.lock}`.
/// Appends for all runs go through one write lock, so each run's records
/// form a total order. An in-memory index keyed by run id tracks chain
/// heads and caches the latest snapshot.
///
/// A store becomes a run's only writer by taking an exclusive file lock on
/// `writer.lock` before its first append. Another store, in this process or
/// another, gets [`PhasegateError::RunLocked`] until the owner releases the
/// run or exits.
pub struct CheckpointStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    index: RwLock<HashMap<RunId, RunIndex>>,
    writers: Mutex<HashMap<RunId, fd_lock::RwLock<File>>>,
}

impl CheckpointStore {
    /// Open or create the ledger directory.
    pub fn open(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            PhasegateError::Store(format!("Failed to create ledger directory {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            metrics: None,
            index: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Report snapshot cache hits and misses.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of one run. Ids that could escape the ledger are refused.
    pub fn run_dir(&self, run_id: &RunId) -> Result<PathBuf> {
        if !run_id.is_valid() {
            return Err(PhasegateError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.dir.join(run_id.as_str()))
    }

    pub fn checkpoints_path(&self, run_id: &RunId) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(CHECKPOINTS_FILE))
    }

    pub fn audit_path(&self, run_id: &RunId) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(AUDIT_FILE))
    }

    fn lock(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunIndex>> {
        self.index.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Become the run's only writer. Idempotent for the owning store.
    ///
    /// Drops any index entry built before the claim, since another writer
    /// may have appended since.
    pub fn claim(&self, run_id: &RunId) -> Result<()> {
        let mut writers = self.writers.lock().unwrap_or_else(|p| p.into_inner());
        if writers.contains_key(run_id) {
            return Ok(());
        }
        let dir = self.run_dir(run_id)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(WRITER_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut lock = fd_lock::RwLock::new(file);
        match lock.try_write() {
            // The OS lock lives as long as the descriptor, not the guard.
            Ok(guard) => std::mem::forget(guard),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(PhasegateError::RunLocked {
                    run: run_id.to_string(),
                    lock: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        writers.insert(run_id.clone(), lock);
        self.lock().remove(run_id);
        debug!(run_id = %run_id, "Writer lock acquired");
        Ok(())
    }

    /// Whether this store holds the run's writer lock.
    pub fn owns(&self, run_id: &RunId) -> bool {
        self.writers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(run_id)
    }

    /// Give up every writer lock this store holds, as on process exit.
    pub fn release_all(&self) {
        let released: Vec<RunId> = self
            .writers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(run_id, _)| run_id)
            .collect();
        let mut index = self.lock();
        for run_id in &released {
            index.remove(run_id);
        }
        debug!(runs = released.len(), "Writer locks released");
    }

    /// Build the index entry for a run from its files, if not already indexed.
    fn ensure_indexed<'a>(
        &self,
        index: &'a mut HashMap<RunId, RunIndex>,
        run_id: &RunId,
    ) -> Result<&'a mut RunIndex> {
        if !index.contains_key(run_id) {
            let mut entry = RunIndex {
                head_hash: GENESIS_HASH.to_string(),
                audit_hash: GENESIS_HASH.to_string(),
                ..Default::default()
            };
            if let Some(last) = last_line(&self.checkpoints_path(run_id)?)? {
                let record: CheckpointRecord = serde_json::from_str(&last)?;
                entry.head_seq = record.seq;
                entry.head_hash = record.hash;
            }
            if let Some(last) = last_line(&self.audit_path(run_id)?)? {
                let audit: AuditEntry = serde_json::from_str(&last)?;
                entry.audit_seq = audit.seq;
                entry.audit_hash = audit.hash;
            }
            index.insert(run_id.clone(), entry);
        }
        index
            .get_mut(run_id)
            .ok_or_else(|| PhasegateError::Store(format!("index missing run {}", run_id)))
    }

    fn timestamp(&self) -> String {
        self.clock.now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Append a snapshot to the run's chain and return its sequence number.
    /// Returns only after the record is durable.
    pub fn append_checkpoint(&self, run_id: &RunId, snapshot: &RunSnapshot) -> Result<u64> {
        self.claim(run_id)?;
        let body = serde_json::to_string(snapshot)?;
        let path = self.checkpoints_path(run_id)?;
        let mut index = self.lock();
        let entry = self.ensure_indexed(&mut index, run_id)?;

        let mut record = CheckpointRecord {
            seq: entry.head_seq + 1,
            run_id: run_id.clone(),
            timestamp: self.timestamp(),
            snapshot_hash: blake3::hash(body.as_bytes()).to_hex().to_string(),
            snapshot: body,
            prev_hash: entry.head_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();

        append_line(&path, &serde_json::to_string(&record)?)?;

        entry.head_seq = record.seq;
        entry.head_hash = record.hash;
        entry.latest = Some(snapshot.clone());
        debug!(run_id = %run_id, seq = record.seq, "Checkpoint appended");
        Ok(record.seq)
    }

    /// Append an audit entry attributed to the run's current checkpoint.
    pub fn append_audit(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.claim(&event.run_id)?;
        let path = self.audit_path(&event.run_id)?;
        let mut index = self.lock();
        let entry = self.ensure_indexed(&mut index, &event.run_id)?;

        let mut audit = AuditEntry {
            seq: entry.audit_seq + 1,
            run_id: event.run_id.clone(),
            checkpoint_seq: entry.head_seq,
            node_id: event.node_id,
            attempt: event.attempt,
            kind: event.kind,
            detail: event.detail,
            timestamp: self.timestamp(),
            prev_hash: entry.audit_hash.clone(),
            hash: String::new(),
        };
        audit.hash = audit.compute_hash();

        append_line(&path, &serde_json::to_string(&audit)?)?;

        entry.audit_seq = audit.seq;
        entry.audit_hash = audit.hash.clone();
        Ok(audit)
    }

    /// Recompute the checkpoint chain from disk.
    pub fn verify_chain(&self, run_id: &RunId) -> Result<ChainReport> {
        let path = self.checkpoints_path(run_id)?;
        if !path.exists() {
            return Err(PhasegateError::RunNotFound(run_id.to_string()));
        }
        let report = verify_file(&path)?;
        if !report.valid {
            warn!(
                run_id = %run_id,
                seq = ?report.first_invalid_seq,
                reason = ?report.reason,
                "Checkpoint chain verification failed"
            );
        }
        Ok(report)
    }

    /// Recompute the audit chain from disk.
    pub fn verify_audit(&self, run_id: &RunId) -> Result<ChainReport> {
        let path = self.audit_path(run_id)?;
        if !path.exists() {
            return Ok(ChainReport::empty());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(verify_audit_lines(&text))
    }

    /// Latest snapshot of a run, from the index cache or from disk.
    pub fn load_latest(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        let cached = self
            .index
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .and_then(|e| e.latest.clone());
        if let Some(snapshot) = cached {
            self.record_cache(true);
            return Ok(Some(snapshot));
        }
        self.record_cache(false);

        let Some(last) = last_line(&self.checkpoints_path(run_id)?)? else {
            return Ok(None);
        };
        let record: CheckpointRecord = serde_json::from_str(&last)?;
        let snapshot: RunSnapshot = serde_json::from_str(&record.snapshot)?;

        let mut index = self.lock();
        let entry = self.ensure_indexed(&mut index, run_id)?;
        if entry.head_seq == record.seq {
            entry.latest = Some(snapshot.clone());
        }
        Ok(Some(snapshot))
    }

    /// Sequence number of the newest checkpoint (0 when none).
    pub fn latest_seq(&self, run_id: &RunId) -> Result<u64> {
        let mut index = self.lock();
        Ok(self.ensure_indexed(&mut index, run_id)?.head_seq)
    }

    /// Head hash of the checkpoint chain.
    pub fn head_hash(&self, run_id: &RunId) -> Result<Option<String>> {
        let mut index = self.lock();
        let entry = self.ensure_indexed(&mut index, run_id)?;
        Ok((entry.head_seq > 0).then(|| entry.head_hash.clone()))
    }

    /// Audit entries recorded against `checkpoint_seq` or later.
    pub fn audit_since(&self, run_id: &RunId, checkpoint_seq: u64) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_audit(run_id)?
            .into_iter()
            .filter(|e| e.checkpoint_seq >= checkpoint_seq)
            .collect())
    }

    pub fn query_audit(&self, run_id: &RunId, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self
            .read_audit(run_id)?
            .into_iter()
            .filter(|e| filter.matches(e));
        Ok(match filter.limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        })
    }

    fn read_audit(&self, run_id: &RunId) -> Result<Vec<AuditEntry>> {
        let path = self.audit_path(run_id)?;
        if !path.exists() {
            return Ok(vec![]);
        }
        let text = std::fs::read_to_string(&path)?;
        text.lines()
            .map(|line| serde_json::from_str(line).map_err(PhasegateError::from))
            .collect()
    }

    /// Store the definition a run was started from. Written once.
    pub fn put_definition(&self, run_id: &RunId, definition: &DagDefinition) -> Result<()> {
        self.claim(run_id)?;
        let path = self.run_dir(run_id)?.join(DEFINITION_FILE);
        if path.exists() {
            return Err(PhasegateError::Store(format!(
                "definition for run {} already recorded",
                run_id
            )));
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(serde_json::to_string_pretty(definition)?.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load_definition(&self, run_id: &RunId) -> Result<DagDefinition> {
        let path = self.run_dir(run_id)?.join(DEFINITION_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| PhasegateError::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Runs with at least one checkpoint, sorted by id.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let run_id = RunId(entry.file_name().to_string_lossy().to_string());
            if run_id.is_valid() && entry.path().join(CHECKPOINTS_FILE).exists() {
                runs.push(run_id);
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn record_cache(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache(hit);
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file: File = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    Ok(())
}

fn last_line(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().last().map(str::to_string))
}
