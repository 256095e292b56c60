use std::sync::Arc;

use phasegate_core::config::GatewayConfig;
use phasegate_engine::Orchestrator;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub orchestrator: Arc<Orchestrator>,
}
