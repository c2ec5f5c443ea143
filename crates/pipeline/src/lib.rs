//! Resilient domain-event processing pipeline.
//!
//! Every published event is driven through the same decision points:
//!
//! ```text
//! admission (BackpressureController)
//!   └─► ordering (SequenceTracker) ── duplicate ──► no-op success
//!         │                        └─ gap ───────► Disordered
//!         ▼
//!   monitoring (ProcessingMonitor)
//!         ▼
//!   execution (RetryCoordinator on a WorkerPool, raced against a timeout)
//! ```
//!
//! [`ResilientEventDispatcher`] composes the components and exposes an
//! aggregated [`SystemHealth`] view.

pub mod backpressure;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod health;
pub mod monitor;
pub mod outcome;
pub mod pool;
pub mod retry;
pub mod sequence;

pub use backpressure::{
    Admission, BackpressureConfig, BackpressureController, BackpressureDecision,
    BackpressureLevel, BackpressureStatus,
};
pub use config::PipelineConfig;
pub use dispatcher::{DispatchOptions, DispatcherBuilder, ResilientEventDispatcher};
pub use error::{ConfigError, DispatchError, PipelineError, Result};
pub use handler::{EventHandler, HandlerError, HandlerRegistry, handler_fn};
pub use health::SystemHealth;
pub use monitor::{HandlerStatistics, ProcessingContext, ProcessingMonitor, ProcessingStatistics};
pub use outcome::{Delivery, DispatchOutcome};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use retry::{
    BackoffKind, Retried, RetryCoordinator, RetryExhausted, RetryPolicy, RetryStatistics,
};
pub use sequence::{
    SequenceRecord, SequenceSlot, SequenceStatistics, SequenceTracker, SequenceValidation,
    SequenceVerdict,
};
