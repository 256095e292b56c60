use serde_json::json;

use phasegate_core::error::PhasegateError;
use phasegate_core::gate::VoteDecision;
use phasegate_core::types::{RunId, RunStatus};
use phasegate_engine::audit::verify_audit_lines;
use phasegate_engine::checkpoint::{verify_file, verify_lines};
use phasegate_engine::CheckpointRecord;
use phasegate_test_utils::{linear_gate_definition, TestHarness};

/// Complete a gated run and return its id.
async fn completed_run(h: &TestHarness) -> RunId {
    let orch = &h.orchestrator;
    let run = orch
        .start_run(linear_gate_definition(1), json!({"batch": 7}))
        .await
        .unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Paused);
    let gate = orch.gates().open_gates(Some(&run))[0].gate_id.clone();
    orch.cast_vote(&gate, "alice", VoteDecision::Approve).await.unwrap();
    assert_eq!(orch.advance(&run).await.unwrap(), RunStatus::Completed);
    run
}

fn read(h: &TestHarness, run: &RunId, file: &str) -> String {
    std::fs::read_to_string(h.orchestrator.store().run_dir(run).unwrap().join(file)).unwrap()
}

fn flip(text: &str, offset: usize) -> String {
    let mut bytes = text.as_bytes().to_vec();
    bytes[offset] ^= 0x01;
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn untouched_ledger_verifies() {
    let h = TestHarness::new();
    let run = completed_run(&h).await;

    let text = read(&h, &run, "checkpoints.jsonl");
    let report = verify_lines(&text);
    assert!(report.is_valid());
    assert_eq!(report.checked as usize, text.lines().count());
    assert_eq!(
        report.head_hash,
        h.orchestrator.store().head_hash(&run).unwrap()
    );

    let audit = read(&h, &run, "audit.jsonl");
    assert!(verify_audit_lines(&audit).is_valid());

    // External tools can check the file without an orchestrator.
    let path = h.orchestrator.store().checkpoints_path(&run).unwrap();
    assert!(verify_file(&path).unwrap().is_valid());
}

#[tokio::test]
async fn any_single_byte_mutation_is_detected() {
    let h = TestHarness::new();
    let run = completed_run(&h).await;
    let text = read(&h, &run, "checkpoints.jsonl");

    let mut line_start = 0;
    for (i, line) in text.lines().enumerate() {
        // Every field of every record gets hit at this stride.
        for offset in (0..line.len()).step_by(11) {
            let mutated = flip(&text, line_start + offset);
            let report = verify_lines(&mutated);
            assert!(
                !report.is_valid(),
                "mutation at record {} byte {} went undetected",
                i + 1,
                offset
            );
            assert!(report.first_invalid_seq.unwrap() <= i as u64 + 1);
        }
        line_start += line.len() + 1;
    }
}

#[tokio::test]
async fn each_chain_component_is_covered() {
    let h = TestHarness::new();
    let run = completed_run(&h).await;
    let text = read(&h, &run, "checkpoints.jsonl");
    let records: Vec<CheckpointRecord> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(records.len() >= 3);

    let render = |records: &[CheckpointRecord]| -> String {
        records
            .iter()
            .map(|r| serde_json::to_string(r).unwrap() + "\n")
            .collect()
    };
    assert!(verify_lines(&render(&records)).is_valid());

    let mut snapshot = records.clone();
    snapshot[1].snapshot = snapshot[1].snapshot.replacen("batch", "Batch", 1);
    let report = verify_lines(&render(&snapshot));
    assert_eq!(report.first_invalid_seq, Some(2));
    assert_eq!(report.reason.as_deref(), Some("snapshot hash mismatch"));

    // Rehashing the snapshot alone still breaks the record hash.
    snapshot[1].snapshot_hash = blake3::hash(snapshot[1].snapshot.as_bytes()).to_hex().to_string();
    let report = verify_lines(&render(&snapshot));
    assert_eq!(report.reason.as_deref(), Some("record hash mismatch"));

    let mut link = records.clone();
    link[2].prev_hash = link[0].hash.clone();
    let report = verify_lines(&render(&link));
    assert_eq!(report.first_invalid_seq, Some(3));
    assert_eq!(report.reason.as_deref(), Some("broken chain link"));

    let mut gap = records.clone();
    gap.remove(1);
    let report = verify_lines(&render(&gap));
    assert_eq!(report.first_invalid_seq, Some(2));
    assert!(report.reason.unwrap().contains("sequence gap"));

    let mut swapped = records.clone();
    swapped.swap(1, 2);
    assert!(!verify_lines(&render(&swapped)).is_valid());
}

#[tokio::test]
async fn audit_chain_detects_edits() {
    let h = TestHarness::new();
    let run = completed_run(&h).await;
    let text = read(&h, &run, "audit.jsonl");

    let edited = text.replacen("\"voter_id\":\"alice\"", "\"voter_id\":\"mallory\"", 1);
    assert_ne!(edited, text);
    assert!(!verify_audit_lines(&edited).is_valid());

    let truncated: String = text.lines().skip(1).map(|l| format!("{}\n", l)).collect();
    let report = verify_audit_lines(&truncated);
    assert_eq!(report.first_invalid_seq, Some(1));
}

#[tokio::test]
async fn broken_chain_refuses_recovery() {
    let h = TestHarness::new();
    let run = completed_run(&h).await;

    let path = h.orchestrator.store().checkpoints_path(&run).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("ingest", "inGest", 1)).unwrap();

    let restarted = h.restart();
    let err = restarted.recover(&run).await.unwrap_err();
    assert!(matches!(err, PhasegateError::ChainIntegrity { .. }));
    assert!(err.is_fatal());
    assert!(!restarted.is_loaded(&run));

    let results = restarted.recover_all().await;
    assert!(results
        .iter()
        .any(|(id, r)| id == &run && matches!(r, Err(PhasegateError::ChainIntegrity { .. }))));
}
