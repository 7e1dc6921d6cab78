use axum::{extract::State, Json};
use crate::models::{HealthResponse, ReadyResponse};
use crate::AppState;
use tracing::debug;

/// Health check endpoint
pub async fn health_check(State(app_state): State<AppState>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: format!("{} is running", app_state.service_name),
    })
}

/// Readiness check endpoint
pub async fn ready_check() -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    // The registry lives in memory, so once the router is up we accept sessions.
    Json(ReadyResponse {
        status: "ok".to_string(),
        message: "Service is ready".to_string(),
        accepting_connections: true,
    })
}
