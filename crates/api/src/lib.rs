//! HTTP API server for the resilient event pipeline.
//!
//! Feeds events through the dispatcher to registered handlers and exposes
//! health, worker-pool and Prometheus observability endpoints.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use pipeline::{PipelineConfig, ResilientEventDispatcher};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handlers::{AUDIT_LOG, AuditLog, AuditLogHandler, ORDER_NOTIFICATIONS, OrderNotificationHandler};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub dispatcher: Arc<ResilientEventDispatcher>,
    pub audit_log: AuditLog,
    pub metrics: PrometheusHandle,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/health/system", get(routes::health::system))
        .route("/pools", get(routes::pools::list))
        .route("/metrics", get(routes::metrics::get))
        .route("/events/{handler}", post(routes::events::publish))
        .route("/audit", get(routes::events::audit))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the default application state with the built-in handlers registered.
pub fn create_default_state(
    config: PipelineConfig,
    metrics: PrometheusHandle,
) -> pipeline::Result<Arc<AppState>> {
    let audit_log = AuditLog::new();

    let dispatcher = ResilientEventDispatcher::builder()
        .config(config)
        .register(AUDIT_LOG, Arc::new(AuditLogHandler::new(audit_log.clone())))
        .register(ORDER_NOTIFICATIONS, Arc::new(OrderNotificationHandler))
        .build()?;

    Ok(Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        audit_log,
        metrics,
    }))
}
