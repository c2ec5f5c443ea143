//! Built-in event handlers served by the API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::DomainEvent;
use pipeline::{EventHandler, HandlerError};
use serde::Serialize;
use tokio::sync::RwLock;

/// Name under which [`AuditLogHandler`] is registered.
pub const AUDIT_LOG: &str = "audit-log";

/// Name under which [`OrderNotificationHandler`] is registered.
pub const ORDER_NOTIFICATIONS: &str = "order-notifications";

/// One event recorded by the audit handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Shared in-memory audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn push(&self, entry: AuditEntry) {
        self.entries.write().await.push(entry);
    }
}

/// Records every event it receives.
#[derive(Debug, Clone)]
pub struct AuditLogHandler {
    log: AuditLog,
}

impl AuditLogHandler {
    pub fn new(log: AuditLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        tracing::info!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            aggregate_id = %event.aggregate_id(),
            sequence = %event.sequence(),
            "audit"
        );
        self.log
            .push(AuditEntry {
                event_id: event.event_id().to_string(),
                event_type: event.event_type().to_string(),
                aggregate_id: event.aggregate_id().to_string(),
                sequence: event.sequence().as_u64(),
                occurred_at: event.occurred_at(),
                recorded_at: Utc::now(),
            })
            .await;
        Ok(())
    }
}

/// Sends (logs) order notifications.
///
/// Payload flags simulate an unreliable channel:
/// - `"fail": true` fails the send with a transient error
/// - `"delay_ms": n` waits `n` milliseconds before sending
#[derive(Debug, Clone, Default)]
pub struct OrderNotificationHandler;

#[async_trait]
impl EventHandler for OrderNotificationHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let payload = event.payload();

        if let Some(delay_ms) = payload.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(HandlerError::transient("notification channel unavailable"));
        }

        if !event.event_type().starts_with("Order") {
            tracing::debug!(event_type = event.event_type(), "not an order event, skipping");
            return Ok(());
        }

        tracing::info!(
            order_id = %event.aggregate_id(),
            event_type = event.event_type(),
            "order notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, payload: serde_json::Value) -> DomainEvent {
        DomainEvent::builder()
            .event_type(event_type)
            .aggregate_id("ORD-1")
            .sequence(1)
            .payload_raw(payload)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_audit_handler_records_events() {
        let log = AuditLog::new();
        let handler = AuditLogHandler::new(log.clone());

        handler
            .handle(&event("OrderPlaced", serde_json::Value::Null))
            .await
            .unwrap();

        let entries = log.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "OrderPlaced");
        assert_eq!(entries[0].aggregate_id, "ORD-1");
        assert_eq!(entries[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_notification_failure_flag_is_transient() {
        let handler = OrderNotificationHandler;

        let result = handler
            .handle(&event("OrderShipped", serde_json::json!({ "fail": true })))
            .await;
        assert!(matches!(result, Err(HandlerError::Transient(_))));

        assert!(
            handler
                .handle(&event("OrderShipped", serde_json::json!({ "fail": false })))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_notification_ignores_other_events() {
        let handler = OrderNotificationHandler;
        assert!(
            handler
                .handle(&event("CustomerRegistered", serde_json::Value::Null))
                .await
                .is_ok()
        );
    }
}
