//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;

/// GET /metrics: Prometheus text exposition.
///
/// Refreshes the health-score gauge before rendering.
pub async fn get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.dispatcher.system_health();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
