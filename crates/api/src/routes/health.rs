//! Health check endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use pipeline::SystemHealth;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub score: f64,
}

/// GET /health: summary status, 503 when the pipeline is degraded.
pub async fn check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.dispatcher.system_health();
    let (code, status) = if health.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status,
            score: health.score,
        }),
    )
}

/// GET /health/system: full component snapshot.
pub async fn system(State(state): State<Arc<AppState>>) -> Json<SystemHealth> {
    Json(state.dispatcher.system_health())
}
