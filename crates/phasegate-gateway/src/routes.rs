use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use phasegate_core::error::PhasegateError;
use phasegate_core::gate::VoteDecision;
use phasegate_core::types::RunId;
use phasegate_engine::{AuditFilter, Orchestrator};

use crate::middleware::Authenticated;
use crate::state::AppState;

/// Error response carrying a status code and a JSON `{"error": ...}` body.
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<PhasegateError> for ApiError {
    fn from(e: PhasegateError) -> Self {
        let status = match &e {
            PhasegateError::RunNotFound(_) | PhasegateError::GateNotFound(_) => StatusCode::NOT_FOUND,
            PhasegateError::DuplicateVote { .. }
            | PhasegateError::InvalidTransition { .. }
            | PhasegateError::RunLocked { .. } => StatusCode::CONFLICT,
            PhasegateError::UnauthorizedVoter(_) => StatusCode::FORBIDDEN,
            PhasegateError::InvalidDefinition(_) | PhasegateError::InvalidRunId(_) => {
                StatusCode::BAD_REQUEST
            }
            PhasegateError::ChainIntegrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

/// Load a run from the store if this process has not seen it yet.
async fn ensure_loaded(orchestrator: &Orchestrator, run_id: &RunId) -> ApiResult<()> {
    if !orchestrator.is_loaded(run_id) {
        orchestrator.recover(run_id).await?;
    }
    Ok(())
}

/// Drive a run in the background; callers poll the status endpoint.
fn spawn_advance(orchestrator: Arc<Orchestrator>, run_id: RunId) {
    tokio::spawn(async move {
        match orchestrator.advance(&run_id).await {
            Ok(status) => info!(run_id = %run_id, %status, "Background advance returned"),
            Err(e) => warn!(run_id = %run_id, error = %e, "Background advance failed"),
        }
    });
}

// GET /api/health (no auth)
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /metrics
pub async fn metrics(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let body = state.orchestrator.metrics().render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

// GET /api/runs
pub async fn list_runs(_auth: Authenticated, State(state): State<Arc<AppState>>) -> ApiResult {
    let mut runs = Vec::new();
    for run_id in state.orchestrator.list_runs()? {
        match state.orchestrator.status(&run_id).await {
            Ok(view) => runs.push(json!({
                "run_id": view.run_id,
                "definition_id": view.definition_id,
                "status": view.status,
                "open_gates": view.open_gates.len(),
                "consumed": view.budget.consumed,
                "updated_at": view.updated_at,
            })),
            Err(e) => runs.push(json!({ "run_id": run_id, "error": e.to_string() })),
        }
    }
    Ok(Json(json!({ "runs": runs })))
}

// GET /api/runs/{id}
pub async fn get_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let view = state.orchestrator.status(&RunId::parse(&id)?).await?;
    Ok(Json(serde_json::to_value(view).map_err(PhasegateError::from)?))
}

// GET /api/runs/{id}/audit?kind=vote_cast&node_id=review&since_seq=3&limit=50
pub async fn run_audit(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(filter): Query<AuditFilter>,
) -> ApiResult {
    let run_id = RunId::parse(&id)?;
    let entries = state.orchestrator.store().query_audit(&run_id, &filter)?;
    Ok(Json(json!({ "run_id": run_id, "entries": entries })))
}

// GET /api/runs/{id}/verify
pub async fn verify_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let run_id = RunId::parse(&id)?;
    let store = state.orchestrator.store();
    let checkpoints = store.verify_chain(&run_id)?;
    let audit = store.verify_audit(&run_id)?;
    Ok(Json(json!({
        "run_id": run_id,
        "valid": checkpoints.is_valid() && audit.is_valid(),
        "checkpoints": checkpoints,
        "audit": audit,
    })))
}

// POST /api/runs/{id}/{action} where action is pause, resume, kill, or advance
pub async fn run_action(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run_id = RunId::parse(&id)?;
    let orchestrator = &state.orchestrator;
    ensure_loaded(orchestrator, &run_id).await?;

    let status = match action.as_str() {
        "pause" => orchestrator.pause(&run_id).await?,
        "kill" => orchestrator.kill(&run_id).await?,
        "resume" => {
            let status = orchestrator.resume(&run_id).await?;
            spawn_advance(orchestrator.clone(), run_id.clone());
            status
        }
        "advance" => {
            spawn_advance(orchestrator.clone(), run_id.clone());
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "run_id": run_id, "accepted": true })),
            ));
        }
        other => return Err(ApiError::bad_request(format!("unknown run action: {other}"))),
    };
    info!(run_id = %run_id, action = %action, %status, "Run action applied");
    Ok((StatusCode::OK, Json(json!({ "run_id": run_id, "status": status }))))
}

#[derive(Deserialize)]
pub struct GatesQuery {
    #[serde(default)]
    pub run_id: Option<String>,
}

// GET /api/gates?run_id=...
pub async fn list_gates(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<GatesQuery>,
) -> ApiResult {
    let run_id = q.run_id.as_deref().map(RunId::parse).transpose()?;
    let gates = state.orchestrator.gates().open_gates(run_id.as_ref());
    Ok(Json(json!({ "gates": gates })))
}

#[derive(Deserialize)]
pub struct VoteBody {
    pub voter_id: String,
    pub decision: String,
    #[serde(default)]
    pub amendment: Option<Value>,
}

// POST /api/gates/{id}/votes
pub async fn vote(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<VoteBody>,
) -> ApiResult {
    let decision = VoteDecision::parse(&body.decision, body.amendment)
        .ok_or_else(|| ApiError::bad_request(format!("unknown decision: {}", body.decision)))?;
    let orchestrator = &state.orchestrator;
    let (run_id, gate_id) = orchestrator.locate_gate(&id)?;
    ensure_loaded(orchestrator, &run_id).await?;

    let status = orchestrator.cast_vote(&gate_id, &body.voter_id, decision).await?;
    let gate = orchestrator.gates().get(&gate_id);
    if !status.is_open() {
        spawn_advance(orchestrator.clone(), run_id);
    }
    Ok(Json(json!({
        "gate_id": gate_id,
        "status": status,
        "approvals": gate.as_ref().map(|g| g.approvals()),
        "rejections": gate.as_ref().map(|g| g.rejections()),
    })))
}
