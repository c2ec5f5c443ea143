//! Worker pool observability endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use pipeline::PoolStats;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct PoolResponse {
    #[serde(flatten)]
    pub stats: PoolStats,
    pub utilization: f64,
    pub queue_utilization: f64,
    pub pressure_score: f64,
}

impl From<PoolStats> for PoolResponse {
    fn from(stats: PoolStats) -> Self {
        Self {
            utilization: stats.utilization(),
            queue_utilization: stats.queue_utilization(),
            pressure_score: stats.pressure_score(),
            stats,
        }
    }
}

/// GET /pools: one entry per named pool.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<PoolResponse>> {
    Json(
        state
            .dispatcher
            .pool_stats()
            .into_iter()
            .map(PoolResponse::from)
            .collect(),
    )
}
