//! Processing lifecycle timing and outcome statistics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use common::{AggregateId, DomainEvent, EventId, SequenceNumber};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::time::Instant;

/// Tracks one admitted event's processing under one handler.
///
/// Exactly one terminal call on the monitor takes effect per context; any
/// later call (e.g. a late completion after a timeout) is ignored.
#[derive(Debug)]
pub struct ProcessingContext {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    sequence: SequenceNumber,
    handler_name: String,
    started_at: Instant,
    completed: AtomicBool,
}

impl ProcessingContext {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Returns true for the first caller only.
    fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Succeeded,
    Failed,
    TimedOut,
}

impl Terminal {
    fn as_str(&self) -> &'static str {
        match self {
            Terminal::Succeeded => "success",
            Terminal::Failed => "failure",
            Terminal::TimedOut => "timeout",
        }
    }
}

#[derive(Debug, Default)]
struct ProcessingCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    processing_micros: AtomicU64,
}

#[derive(Debug, Default, Clone)]
struct HandlerCounters {
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    processing_micros: u64,
}

/// Per-handler outcome counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerStatistics {
    pub handler: String,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub total_processing_ms: u64,
}

/// Aggregate outcome counts. `failed` includes timeouts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStatistics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub active: usize,
    pub success_rate: f64,
    pub total_processing_ms: u64,
    pub average_processing_ms: f64,
    pub handlers: Vec<HandlerStatistics>,
}

/// Records the start and terminal outcome of every monitored delivery.
#[derive(Debug, Default)]
pub struct ProcessingMonitor {
    in_flight: DashSet<(EventId, String)>,
    counters: ProcessingCounters,
    handlers: DashMap<String, HandlerCounters>,
}

impl ProcessingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a context for `event` under `handler_name`.
    ///
    /// Returns `None` if that event is already in flight under the same
    /// handler.
    pub fn start(&self, event: &DomainEvent, handler_name: &str) -> Option<ProcessingContext> {
        if !self
            .in_flight
            .insert((event.event_id(), handler_name.to_string()))
        {
            tracing::warn!(
                event_id = %event.event_id(),
                handler = handler_name,
                "event already in flight under this handler"
            );
            return None;
        }

        self.counters.started.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("pipeline_processing_active").set(self.in_flight.len() as f64);

        Some(ProcessingContext {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().clone(),
            sequence: event.sequence(),
            handler_name: handler_name.to_string(),
            started_at: Instant::now(),
            completed: AtomicBool::new(false),
        })
    }

    /// Records success or failure. Returns false if the context had
    /// already reached a terminal state.
    pub fn complete(&self, context: &ProcessingContext, success: bool, error: Option<&str>) -> bool {
        let terminal = if success {
            Terminal::Succeeded
        } else {
            Terminal::Failed
        };
        let recorded = self.finish(context, terminal);
        if recorded && let Some(error) = error {
            tracing::debug!(
                event_id = %context.event_id,
                handler = %context.handler_name,
                error,
                "processing failed"
            );
        }
        recorded
    }

    /// Records a timeout, counted as a failure as well. Returns false if the
    /// context had already reached a terminal state.
    pub fn record_timeout(&self, context: &ProcessingContext, timeout: Duration) -> bool {
        let recorded = self.finish(context, Terminal::TimedOut);
        if recorded {
            tracing::debug!(
                event_id = %context.event_id,
                handler = %context.handler_name,
                ?timeout,
                "processing timed out"
            );
        }
        recorded
    }

    fn finish(&self, context: &ProcessingContext, terminal: Terminal) -> bool {
        if !context.mark_completed() {
            return false;
        }
        self.in_flight
            .remove(&(context.event_id, context.handler_name.clone()));

        let elapsed = context.elapsed();
        let micros = elapsed.as_micros() as u64;
        self.counters
            .processing_micros
            .fetch_add(micros, Ordering::SeqCst);
        match terminal {
            Terminal::Succeeded => {
                self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Terminal::Failed => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            Terminal::TimedOut => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                self.counters.timed_out.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut handler = self
                .handlers
                .entry(context.handler_name.clone())
                .or_default();
            handler.processing_micros += micros;
            match terminal {
                Terminal::Succeeded => handler.succeeded += 1,
                Terminal::Failed => handler.failed += 1,
                Terminal::TimedOut => {
                    handler.failed += 1;
                    handler.timed_out += 1;
                }
            }
        }

        let handler = context.handler_name.clone();
        metrics::counter!(
            "pipeline_processing_total",
            "handler" => handler.clone(),
            "outcome" => terminal.as_str()
        )
        .increment(1);
        metrics::histogram!("pipeline_processing_duration_seconds", "handler" => handler)
            .record(elapsed.as_secs_f64());
        metrics::gauge!("pipeline_processing_active").set(self.in_flight.len() as f64);
        true
    }

    /// Returns true if `event_id` is currently being processed by `handler_name`.
    pub fn is_in_flight(&self, event_id: EventId, handler_name: &str) -> bool {
        self.in_flight
            .contains(&(event_id, handler_name.to_string()))
    }

    pub fn handler_statistics(&self, handler_name: &str) -> Option<HandlerStatistics> {
        self.handlers
            .get(handler_name)
            .map(|counters| to_handler_statistics(handler_name, counters.value()))
    }

    pub fn statistics(&self) -> ProcessingStatistics {
        let succeeded = self.counters.succeeded.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        let completed = succeeded + failed;
        let micros = self.counters.processing_micros.load(Ordering::SeqCst);

        let mut handlers: Vec<HandlerStatistics> = self
            .handlers
            .iter()
            .map(|entry| to_handler_statistics(entry.key(), entry.value()))
            .collect();
        handlers.sort_by(|a, b| a.handler.cmp(&b.handler));

        ProcessingStatistics {
            total: self.counters.started.load(Ordering::SeqCst),
            succeeded,
            failed,
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
            active: self.in_flight.len(),
            success_rate: if completed == 0 {
                1.0
            } else {
                succeeded as f64 / completed as f64
            },
            total_processing_ms: micros / 1000,
            average_processing_ms: if completed == 0 {
                0.0
            } else {
                micros as f64 / completed as f64 / 1000.0
            },
            handlers,
        }
    }
}

fn to_handler_statistics(name: &str, counters: &HandlerCounters) -> HandlerStatistics {
    HandlerStatistics {
        handler: name.to_string(),
        succeeded: counters.succeeded,
        failed: counters.failed,
        timed_out: counters.timed_out,
        total_processing_ms: counters.processing_micros / 1000,
    }
}
