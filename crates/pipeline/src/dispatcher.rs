//! The resilient event dispatcher.
//!
//! Drives one event through admission, ordering, monitoring and
//! retry-wrapped execution under a timeout, producing exactly one
//! [`DispatchOutcome`] per delivery.

use std::sync::Arc;
use std::time::Duration;

use common::DomainEvent;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backpressure::{Admission, BackpressureController, BackpressureDecision, BackpressureLevel};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::handler::{EventHandler, HandlerError, HandlerRegistry};
use crate::health::SystemHealth;
use crate::monitor::ProcessingMonitor;
use crate::outcome::DispatchOutcome;
use crate::pool::{PoolStats, WorkerPool};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::sequence::{SequenceTracker, SequenceVerdict};

/// Per-call overrides. Unset fields use the dispatcher's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOptions {
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Wires configuration, handlers and (optionally) pre-built components.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    config: PipelineConfig,
    registry: HandlerRegistry,
    sequence: Option<Arc<SequenceTracker>>,
    backpressure: Option<Arc<BackpressureController>>,
    monitor: Option<Arc<ProcessingMonitor>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn sequence_tracker(mut self, tracker: Arc<SequenceTracker>) -> Self {
        self.sequence = Some(tracker);
        self
    }

    /// Use an existing controller instead of one built from the config.
    /// A supplied controller is not bound to the event-processing pool.
    pub fn backpressure(mut self, controller: Arc<BackpressureController>) -> Self {
        self.backpressure = Some(controller);
        self
    }

    pub fn monitor(mut self, monitor: Arc<ProcessingMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<ResilientEventDispatcher> {
        self.config.validate()?;

        let event_pool = WorkerPool::new(self.config.event_pool.clone());
        let retry_pool = WorkerPool::new(self.config.retry_pool.clone());

        let backpressure = match self.backpressure {
            Some(controller) => controller,
            None => Arc::new(
                BackpressureController::new(self.config.backpressure.clone())?
                    .with_pool(event_pool.clone()),
            ),
        };

        tracing::debug!(
            handlers = ?self.registry.names(),
            event_workers = self.config.event_pool.max_workers,
            retry_workers = self.config.retry_pool.max_workers,
            "dispatcher built"
        );

        Ok(ResilientEventDispatcher {
            sequence: self.sequence.unwrap_or_default(),
            monitor: self.monitor.unwrap_or_default(),
            retry: Arc::new(RetryCoordinator::with_pool(retry_pool.clone())),
            backpressure,
            event_pool,
            retry_pool,
            registry: self.registry,
            config: self.config,
        })
    }
}

/// Orchestrates the pipeline components for every delivery.
#[derive(Debug)]
pub struct ResilientEventDispatcher {
    config: PipelineConfig,
    registry: HandlerRegistry,
    sequence: Arc<SequenceTracker>,
    backpressure: Arc<BackpressureController>,
    monitor: Arc<ProcessingMonitor>,
    retry: Arc<RetryCoordinator>,
    event_pool: WorkerPool,
    retry_pool: WorkerPool,
}

impl ResilientEventDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Dispatches `event` to the handler registered as `handler_name`.
    ///
    /// Fails only when no such handler is registered; every delivery
    /// outcome, including errors, is reported through [`DispatchOutcome`].
    pub async fn handle(
        &self,
        event: DomainEvent,
        handler_name: &str,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        let handler = self.resolve(handler_name)?;
        Ok(self.handle_with(event, handler_name, handler, options).await)
    }

    /// Dispatches `event` to an explicitly supplied handler.
    #[tracing::instrument(
        skip_all,
        fields(
            event_id = %event.event_id(),
            aggregate_id = %event.aggregate_id(),
            sequence = %event.sequence(),
            handler = handler_name,
        )
    )]
    pub async fn handle_with(
        &self,
        event: DomainEvent,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
        options: DispatchOptions,
    ) -> DispatchOutcome {
        let outcome = self.drive(event, handler_name, handler, options).await;
        metrics::counter!("pipeline_dispatch_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    /// Spawns the dispatch and returns its handle immediately.
    pub fn submit(
        self: &Arc<Self>,
        event: DomainEvent,
        handler_name: impl Into<String>,
        options: DispatchOptions,
    ) -> Result<JoinHandle<DispatchOutcome>> {
        let handler_name = handler_name.into();
        let handler = self.resolve(&handler_name)?;
        let dispatcher = Arc::clone(self);
        Ok(tokio::spawn(async move {
            dispatcher
                .handle_with(event, &handler_name, handler, options)
                .await
        }))
    }

    fn resolve(&self, handler_name: &str) -> Result<Arc<dyn EventHandler>> {
        self.registry
            .get(handler_name)
            .ok_or_else(|| PipelineError::UnknownHandler(handler_name.to_string()))
    }

    async fn drive(
        &self,
        event: DomainEvent,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
        options: DispatchOptions,
    ) -> DispatchOutcome {
        // Held across any admission delay so that same-aggregate deliveries
        // are validated in the order they were received.
        let slot = self.sequence.reserve(event.aggregate_id()).await;

        let admission = match self.admit().await {
            Ok(admission) => admission,
            Err(level) => {
                tracing::warn!(%level, "event rejected by backpressure");
                return DispatchOutcome::Rejected { level };
            }
        };

        let validation = slot.validate(&event);
        match validation.verdict {
            SequenceVerdict::InOrder => {}
            SequenceVerdict::Duplicate => {
                tracing::debug!(
                    last_seen = %validation.record.last_seen,
                    "duplicate delivery, skipping handler"
                );
                return DispatchOutcome::Duplicate {
                    sequence: validation.actual,
                    last_seen: validation.record.last_seen,
                };
            }
            SequenceVerdict::OutOfOrder => {
                tracing::warn!(
                    expected = %validation.expected(),
                    actual = %validation.actual,
                    "sequence gap detected"
                );
                return DispatchOutcome::Disordered {
                    expected: validation.expected(),
                    actual: validation.actual,
                };
            }
        }

        // The sequence was accepted, so a clash here is a reused event id.
        let Some(context) = self.monitor.start(&event, handler_name) else {
            tracing::warn!(
                sequence = %event.sequence(),
                last_seen = %validation.record.last_seen,
                "event id already in flight for this handler"
            );
            return DispatchOutcome::Failed {
                attempts: 0,
                error: HandlerError::Permanent(format!(
                    "event {} is already being processed by {handler_name}",
                    event.event_id()
                )),
            };
        };

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let policy = options
            .retry_policy
            .unwrap_or_else(|| self.config.default_retry.clone());
        let retry = Arc::clone(&self.retry);
        let event = Arc::new(event);

        let execution = async move {
            retry
                .execute_with_retry(&policy, || {
                    let handler = Arc::clone(&handler);
                    let event = Arc::clone(&event);
                    async move { handler.handle(&event).await }
                })
                .await
        };

        let mut task = match self.event_pool.spawn(execution) {
            Ok(task) => task,
            Err(error) => {
                let message = error.to_string();
                tracing::warn!(%error, "event-processing pool refused delivery");
                self.monitor.complete(&context, false, Some(&message));
                return DispatchOutcome::Failed {
                    attempts: 0,
                    error: HandlerError::Transient(message),
                };
            }
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(retried))) => {
                self.monitor.complete(&context, true, None);
                tracing::debug!(attempts = retried.attempts, "event processed");
                DispatchOutcome::Succeeded {
                    attempts: retried.attempts,
                    elapsed: context.elapsed(),
                }
            }
            Ok(Ok(Err(exhausted))) => {
                let message = exhausted.last_error.to_string();
                self.monitor.complete(&context, false, Some(&message));
                DispatchOutcome::Failed {
                    attempts: exhausted.attempts,
                    error: exhausted.last_error,
                }
            }
            Ok(Err(join_error)) => {
                // Attempt panics are caught by the coordinator; this is the
                // task itself going away.
                let error = HandlerError::Panicked(join_error.to_string());
                let message = error.to_string();
                tracing::warn!(%error, "handler task failed");
                self.monitor.complete(&context, false, Some(&message));
                DispatchOutcome::Failed { attempts: 1, error }
            }
            Err(_) => {
                if self.config.cancel_on_timeout {
                    task.abort();
                }
                let elapsed = started.elapsed();
                self.monitor.record_timeout(&context, timeout);
                tracing::warn!(?timeout, ?elapsed, "event processing timed out");
                DispatchOutcome::TimedOut { timeout, elapsed }
            }
        };

        drop(admission);
        outcome
    }

    /// Admits one delivery, waiting out a single suggested delay if asked to.
    async fn admit(&self) -> std::result::Result<Admission, BackpressureLevel> {
        match self.backpressure.assess() {
            (_, BackpressureDecision::Proceed) => {}
            (level, BackpressureDecision::Reject) => return Err(level),
            (level, BackpressureDecision::Delay) => {
                let delay = self.backpressure.config().delay_for(level);
                tracing::debug!(%level, ?delay, "admission delayed");
                tokio::time::sleep(delay).await;
                if let (level, BackpressureDecision::Reject) = self.backpressure.assess() {
                    return Err(level);
                }
            }
        }
        Ok(self.backpressure.admit())
    }

    /// Composes every component's snapshot. Reads only.
    pub fn system_health(&self) -> SystemHealth {
        let health = SystemHealth::compose(
            self.monitor.statistics(),
            self.retry.statistics(),
            self.backpressure.status(),
            self.sequence.statistics(),
            self.pool_stats(),
        );
        metrics::gauge!("pipeline_health_score").set(health.score);
        health
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        vec![self.event_pool.stats(), self.retry_pool.stats()]
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn sequence_tracker(&self) -> &Arc<SequenceTracker> {
        &self.sequence
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    pub fn monitor(&self) -> &Arc<ProcessingMonitor> {
        &self.monitor
    }

    pub fn retry_coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    pub fn event_pool(&self) -> &WorkerPool {
        &self.event_pool
    }

    pub fn retry_pool(&self) -> &WorkerPool {
        &self.retry_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::handler::handler_fn;
    use crate::pool::PoolConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(aggregate: &str, sequence: u64) -> DomainEvent {
        DomainEvent::builder()
            .event_type("OrderPlaced")
            .aggregate_id(aggregate)
            .sequence(sequence)
            .build()
            .unwrap()
    }

    fn ok_handler() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Ok(()) })
    }

    fn dispatcher() -> ResilientEventDispatcher {
        ResilientEventDispatcher::builder()
            .register("ok", ok_handler())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_handler_is_an_error() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .handle(event("ORD-1", 1), "missing", DispatchOptions::new())
            .await;
        assert!(matches!(result, Err(PipelineError::UnknownHandler(name)) if name == "missing"));
        assert_eq!(dispatcher.monitor().statistics().total, 0);
    }

    #[tokio::test]
    async fn test_successful_delivery_releases_occupancy() {
        let dispatcher = dispatcher();
        let outcome = dispatcher
            .handle(event("ORD-1", 1), "ok", DispatchOptions::new())
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Succeeded { attempts: 1, .. }));
        assert_eq!(dispatcher.backpressure().in_flight(), 0);
        assert_eq!(dispatcher.monitor().statistics().succeeded, 1);
        assert_eq!(dispatcher.event_pool().stats().completed_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flaky = handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::transient("not yet"))
                } else {
                    Ok(())
                }
            }
        });
        let dispatcher = ResilientEventDispatcher::builder()
            .register("flaky", flaky)
            .build()
            .unwrap();

        let outcome = dispatcher
            .handle(
                event("ORD-1", 1),
                "flaky",
                DispatchOptions::new()
                    .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(10))),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Succeeded { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.retry_pool().stats().completed_tasks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_failure() {
        let dispatcher = ResilientEventDispatcher::builder()
            .register(
                "broken",
                handler_fn(|_event| async { Err(HandlerError::transient("down")) }),
            )
            .build()
            .unwrap();

        let outcome = dispatcher
            .handle(
                event("ORD-1", 1),
                "broken",
                DispatchOptions::new()
                    .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(5))),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 2,
                error: HandlerError::transient("down"),
            }
        );
        let stats = dispatcher.monitor().statistics();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(dispatcher.backpressure().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_delivery() {
        let dispatcher = ResilientEventDispatcher::builder()
            .register(
                "panics",
                handler_fn(|event: DomainEvent| async move {
                    if event.sequence().as_u64() > 0 {
                        panic!("handler bug");
                    }
                    Ok(())
                }),
            )
            .build()
            .unwrap();

        let outcome = dispatcher
            .handle(event("ORD-1", 1), "panics", DispatchOptions::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 1,
                error: HandlerError::Panicked(_)
            }
        ));
        assert_eq!(dispatcher.backpressure().in_flight(), 0);
        assert_eq!(dispatcher.retry_coordinator().statistics().exhausted, 1);
        assert_eq!(dispatcher.monitor().statistics().failed, 1);
    }

    #[tokio::test]
    async fn test_reused_event_id_in_flight_fails_delivery() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = Arc::clone(&gate);
        let dispatcher = Arc::new(
            ResilientEventDispatcher::builder()
                .register(
                    "gated",
                    handler_fn(move |_event| {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notified().await;
                            Ok(())
                        }
                    }),
                )
                .build()
                .unwrap(),
        );

        let first = event("ORD-1", 1);
        let reused = DomainEvent::builder()
            .event_id(first.event_id())
            .event_type("OrderPlaced")
            .aggregate_id("ORD-2")
            .sequence(1)
            .build()
            .unwrap();

        let pending = dispatcher
            .submit(first.clone(), "gated", DispatchOptions::new())
            .unwrap();
        while !dispatcher.monitor().is_in_flight(first.event_id(), "gated") {
            tokio::task::yield_now().await;
        }

        let outcome = dispatcher
            .handle(reused, "gated", DispatchOptions::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 0,
                error: HandlerError::Permanent(_)
            }
        ));

        release.notify_one();
        assert!(pending.await.unwrap().is_success());
        assert_eq!(dispatcher.backpressure().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_then_admit() {
        let controller = Arc::new(
            BackpressureController::new(BackpressureConfig {
                capacity: 10,
                ..BackpressureConfig::default()
            })
            .unwrap(),
        );
        let dispatcher = ResilientEventDispatcher::builder()
            .backpressure(Arc::clone(&controller))
            .register("ok", ok_handler())
            .build()
            .unwrap();

        // 7/10 is MODERATE: delayed once, then admitted.
        for _ in 0..7 {
            controller.on_admitted();
        }
        let start = Instant::now();
        let outcome = dispatcher
            .handle(event("ORD-1", 1), "ok", DispatchOptions::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(start.elapsed() >= Duration::from_millis(50));
        let status = controller.status();
        assert_eq!(status.delayed, 2);
        assert_eq!(status.in_flight, 7);
    }

    #[tokio::test]
    async fn test_saturated_event_pool_fails_without_attempts() {
        let config = PipelineConfig {
            event_pool: PoolConfig::new("event-processing", 1, 0),
            ..PipelineConfig::default()
        };
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let blocking = handler_fn(move |_event| {
            let release_rx = Arc::clone(&release_rx);
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(())
            }
        });
        let dispatcher = Arc::new(
            ResilientEventDispatcher::builder()
                .config(config)
                .register("blocking", blocking)
                .register("ok", ok_handler())
                .build()
                .unwrap(),
        );

        let first = dispatcher
            .submit(event("ORD-1", 1), "blocking", DispatchOptions::new())
            .unwrap();
        while dispatcher.event_pool().stats().active_workers == 0 {
            tokio::task::yield_now().await;
        }

        let outcome = dispatcher
            .handle(event("ORD-2", 1), "ok", DispatchOptions::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                attempts: 0,
                error: HandlerError::Transient(_)
            }
        ));

        release_tx.send(()).unwrap();
        assert!(first.await.unwrap().is_success());
        assert_eq!(dispatcher.backpressure().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_system_health_is_idempotent() {
        let dispatcher = dispatcher();
        dispatcher
            .handle(event("ORD-1", 1), "ok", DispatchOptions::new())
            .await
            .unwrap();

        let first = dispatcher.system_health();
        let second = dispatcher.system_health();
        assert_eq!(first, second);
        assert_eq!(first.pools.len(), 2);
        assert!(first.is_healthy());
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let config = PipelineConfig {
            default_timeout: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let result = ResilientEventDispatcher::builder().config(config).build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
