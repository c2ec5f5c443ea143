//! Event ingress and audit trail endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use common::DomainEvent;
use pipeline::DispatchOptions;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use crate::handlers::AuditEntry;

#[derive(Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub aggregate_id: String,
    pub sequence: u64,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Overrides the configured processing timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PublishEventResponse {
    pub outcome: &'static str,
    pub attempts: u32,
}

/// POST /events/{handler}: dispatch one event through the pipeline.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Path(handler): Path<String>,
    Json(req): Json<PublishEventRequest>,
) -> Result<Json<PublishEventResponse>, ApiError> {
    if req.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("event_type must not be empty".into()));
    }
    if req.aggregate_id.trim().is_empty() {
        return Err(ApiError::BadRequest("aggregate_id must not be empty".into()));
    }
    if req.sequence == 0 {
        return Err(ApiError::BadRequest("sequence numbers start at 1".into()));
    }

    let mut options = DispatchOptions::new();
    if let Some(timeout_ms) = req.timeout_ms {
        if timeout_ms == 0 {
            return Err(ApiError::BadRequest("timeout_ms must be positive".into()));
        }
        options = options.with_timeout(Duration::from_millis(timeout_ms));
    }

    let event = DomainEvent::builder()
        .event_type(req.event_type)
        .aggregate_id(req.aggregate_id)
        .sequence(req.sequence)
        .payload_raw(req.payload.unwrap_or_default())
        .build()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    metrics::counter!("api_events_received_total", "handler" => handler.clone()).increment(1);

    let outcome = state.dispatcher.handle(event, &handler, options).await?;
    let response = PublishEventResponse {
        outcome: outcome.as_str(),
        attempts: outcome.attempts(),
    };
    outcome.into_result()?;

    Ok(Json(response))
}

/// GET /audit: events recorded by the audit-log handler.
pub async fn audit(State(state): State<Arc<AppState>>) -> Json<Vec<AuditEntry>> {
    Json(state.audit_log.entries().await)
}
