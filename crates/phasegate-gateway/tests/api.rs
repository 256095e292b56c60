use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use phasegate_core::config::GatewayConfig;
use phasegate_core::types::{RunId, RunStatus};
use phasegate_gateway::GatewayServer;
use phasegate_test_utils::{linear_gate_definition, TestHarness};

fn router(h: &TestHarness, token: Option<&str>) -> Router {
    let config = GatewayConfig {
        token: token.map(|t| t.to_string()),
        ..Default::default()
    };
    GatewayServer::new(config, h.orchestrator.clone()).router()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn paused_at_review(h: &TestHarness, approvals: u32) -> RunId {
    let run = h
        .orchestrator
        .start_run(linear_gate_definition(approvals), json!({}))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.advance(&run).await.unwrap(), RunStatus::Paused);
    run
}

#[tokio::test]
async fn health_is_public() {
    let h = TestHarness::new();
    let app = router(&h, Some("secret"));
    let (status, body) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn token_required_when_configured() {
    let h = TestHarness::new();
    let app = router(&h, Some("secret"));

    let (status, _) = send(&app, get("/api/runs")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/runs")
        .header("authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"], json!([]));

    let (status, _) = send(&app, get("/api/runs?token=secret")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn vote_over_http_resolves_gate() {
    let h = TestHarness::new();
    let app = router(&h, None);
    let run = paused_at_review(&h, 1).await;

    let (status, body) = send(&app, get(&format!("/api/gates?run_id={}", run))).await;
    assert_eq!(status, StatusCode::OK);
    let gates = body["gates"].as_array().unwrap();
    assert_eq!(gates.len(), 1);
    let gate_id = gates[0]["gate_id"].as_str().unwrap().to_string();

    // Prefix lookup, as an operator would type it.
    let uri = format!("/api/gates/{}/votes", &gate_id[..8]);
    let (status, body) = send(
        &app,
        post_json(&uri, json!({"voter_id": "alice", "decision": "approve"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gate_id"], gate_id);
    assert_eq!(body["approvals"], 1);

    assert_eq!(h.orchestrator.advance(&run).await.unwrap(), RunStatus::Completed);
    let (status, body) = send(&app, get(&format!("/api/runs/{}", run))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn vote_errors_map_to_status_codes() {
    let h = TestHarness::new();
    let app = router(&h, None);
    let run = paused_at_review(&h, 2).await;
    let gate_id = h.orchestrator.gates().open_gates(Some(&run))[0].gate_id.clone();
    let uri = format!("/api/gates/{}/votes", gate_id);

    let (status, _) = send(
        &app,
        post_json(&uri, json!({"voter_id": "alice", "decision": "maybe"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/gates/no-such-gate/votes",
            json!({"voter_id": "alice", "decision": "approve"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let vote = json!({"voter_id": "alice", "decision": "approve"});
    let (status, _) = send(&app, post_json(&uri, vote.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, post_json(&uri, vote)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already voted"));
}

#[tokio::test]
async fn audit_query_and_verification() {
    let h = TestHarness::new();
    let app = router(&h, None);
    let run = paused_at_review(&h, 1).await;

    let (status, body) = send(&app, get(&format!("/api/runs/{}/audit", run))).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries[0]["kind"], "run_started");

    let uri = format!("/api/runs/{}/audit?kind=gate_created&node_id=review", run);
    let (_, body) = send(&app, get(&uri)).await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, get(&format!("/api/runs/{}/verify", run))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert!(body["checkpoints"]["checked"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn run_actions() {
    let h = TestHarness::new();
    let app = router(&h, None);
    let run = paused_at_review(&h, 1).await;

    let (status, body) = send(&app, post_json(&format!("/api/runs/{}/pause", run), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");

    let (status, _) = send(&app, post_json(&format!("/api/runs/{}/explode", run), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, post_json(&format!("/api/runs/{}/kill", run), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "killed");

    // Resuming a killed run is not a valid transition.
    let (status, _) = send(&app, post_json(&format!("/api/runs/{}/resume", run), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, get("/api/runs/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_run_ids_are_rejected() {
    let h = TestHarness::new();
    let app = router(&h, None);
    paused_at_review(&h, 1).await;

    for uri in [
        "/api/runs/%2E%2E",
        "/api/runs/%2E%2E%2Fledger/verify",
        "/api/runs/run.1/audit",
        "/api/gates?run_id=..%2F..%2Fetc",
    ] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("Invalid run id"), "{uri}");
    }
    let (status, _) = send(&app, post_json("/api/runs/%2E%2E/kill", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_exposition() {
    let h = TestHarness::new();
    let app = router(&h, None);
    paused_at_review(&h, 1).await;

    let resp = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("phasegate_executor_invocations_total 1"));
}
