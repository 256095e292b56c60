use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use phasegate_core::config::GatewayConfig;
use phasegate_engine::Orchestrator;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway for votes, run control, audit queries, and metrics.
pub struct GatewayServer {
    config: GatewayConfig,
    orchestrator: Arc<Orchestrator>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// The full route table, without binding a listener.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            orchestrator: self.orchestrator.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            // Runs
            .route("/api/runs", get(routes::list_runs))
            .route("/api/runs/{id}", get(routes::get_run))
            .route("/api/runs/{id}/audit", get(routes::run_audit))
            .route("/api/runs/{id}/verify", get(routes::verify_run))
            .route("/api/runs/{id}/{action}", post(routes::run_action))
            // Gates
            .route("/api/gates", get(routes::list_gates))
            .route("/api/gates/{id}/votes", post(routes::vote))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(
            bind = %self.config.bind,
            auth = self.config.token.is_some(),
            "Gateway listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
