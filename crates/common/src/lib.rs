//! Shared types for the resilient event pipeline.
//!
//! - [`AggregateId`], [`EventId`] and [`SequenceNumber`] identify events and
//!   the aggregates they belong to
//! - [`DomainEvent`] is the immutable value handed to the pipeline by
//!   producing services

pub mod event;
pub mod types;

pub use event::{DomainEvent, DomainEventBuilder, EventBuildError};
pub use types::{AggregateId, EventId, SequenceNumber};
