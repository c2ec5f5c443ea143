//! Pipeline error types.

use std::time::Duration;

use common::SequenceNumber;
use thiserror::Error;

use crate::backpressure::BackpressureLevel;
use crate::handler::HandlerError;

/// Terminal failures of a single event delivery.
///
/// Rejection and disorder are signals for the producer's own
/// retry/compensation strategy; timeout and processing failure mean the
/// pipeline's internal retries were already attempted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// The backpressure controller refused admission; the event was dropped.
    #[error("Event rejected by backpressure at {level} load")]
    BackpressureRejected { level: BackpressureLevel },

    /// The event skipped ahead of its aggregate's expected sequence.
    #[error("Sequence disorder: expected {expected}, actual {actual}")]
    SequenceDisorder {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The retry-wrapped handler did not finish within the timeout.
    #[error("Processing timed out after {elapsed:?} (timeout {timeout:?})")]
    Timeout { timeout: Duration, elapsed: Duration },

    /// The handler kept failing until the retry policy was exhausted.
    #[error("Processing failed after {attempts} attempt(s): {error}")]
    ProcessingFailed { attempts: u32, error: HandlerError },
}

/// Invalid pipeline configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("backpressure capacity must be greater than zero")]
    ZeroCapacity,

    #[error(
        "backpressure thresholds must satisfy 0 < moderate < high < critical <= 1 (got {moderate}, {high}, {critical})"
    )]
    InvalidThresholds {
        moderate: f64,
        high: f64,
        critical: f64,
    },

    #[error("moderate backpressure delay must be greater than zero")]
    ZeroDelay,

    #[error("retry policy must allow at least one attempt")]
    ZeroAttempts,

    #[error("worker pool '{0}' needs at least one worker")]
    EmptyPool(String),

    #[error("default timeout must be greater than zero")]
    ZeroTimeout,
}

/// Errors raised by the pipeline's own plumbing (as opposed to delivery outcomes).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No handler is registered under the requested name.
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    /// A worker pool's wait queue is full.
    #[error("Worker pool '{pool}' is saturated ({queued} tasks waiting)")]
    PoolSaturated { pool: String, queued: usize },

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience type alias for pipeline results.
pub type Result<T> = std::result::Result<T, PipelineError>;
