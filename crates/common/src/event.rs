use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AggregateId, EventId, SequenceNumber};

/// A published domain event as consumed by the pipeline.
///
/// Events are immutable once constructed; all fields are exposed through
/// accessors. Use [`DomainEvent::builder`] to construct one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    sequence: SequenceNumber,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl DomainEvent {
    /// Creates a new event builder.
    pub fn builder() -> DomainEventBuilder {
        DomainEventBuilder::default()
    }

    /// Unique identifier of this event instance.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// The type tag of the event (e.g. "OrderPlaced").
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Producer-assigned position within the aggregate's stream.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// When the event occurred.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// The event payload as JSON.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Additional metadata about the event.
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }
}

/// Error returned when a required event field was never set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBuildError {
    #[error("missing required event field: {0}")]
    MissingField(&'static str),
}

/// Builder for constructing domain events.
#[derive(Debug, Default)]
pub struct DomainEventBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    sequence: Option<SequenceNumber>,
    occurred_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl DomainEventBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the owning aggregate.
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Sets the sequence number.
    pub fn sequence(mut self, sequence: impl Into<SequenceNumber>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Sets the occurrence time. If not set, the current time will be used.
    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event, failing on the first missing required field.
    pub fn build(self) -> Result<DomainEvent, EventBuildError> {
        Ok(DomainEvent {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self
                .event_type
                .ok_or(EventBuildError::MissingField("event_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventBuildError::MissingField("aggregate_id"))?,
            sequence: self
                .sequence
                .ok_or(EventBuildError::MissingField("sequence"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            payload: self.payload.unwrap_or(serde_json::Value::Null),
            metadata: self.metadata,
        })
    }
}
