//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pipeline::{DispatchError, PipelineError};
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// The pipeline cannot take more work right now.
    #[error("{0}")]
    Unavailable(String),
    /// Terminal delivery failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Dispatch(err) => dispatch_error_status(err),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, %status, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn dispatch_error_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::BackpressureRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::SequenceDisorder { .. } => StatusCode::CONFLICT,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::ProcessingFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnknownHandler(_) => ApiError::NotFound(err.to_string()),
            PipelineError::PoolSaturated { .. } => ApiError::Unavailable(err.to_string()),
            PipelineError::Config(_) => ApiError::Internal(err.to_string()),
        }
    }
}
