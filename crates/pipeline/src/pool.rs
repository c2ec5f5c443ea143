//! Bounded, observable worker pools.
//!
//! A pool admits at most `max_workers + queue_capacity` tasks at once: up to
//! `max_workers` run concurrently, the rest wait for a permit. Pool load is
//! summarized as a pressure score:
//!
//! ```text
//! pressure = clamp(0.7 * active / max_workers + 0.3 * queued / (queued + remaining), 0, 1)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, Result};

/// Name of the pool that executes event handlers.
pub const EVENT_PROCESSING_POOL: &str = "event-processing";

/// Name of the pool that resumes retried attempts.
pub const RETRY_POOL: &str = "retry";

/// Sizing for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub max_workers: usize,
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            queue_capacity,
        }
    }

    /// Default sizing for handler execution.
    pub fn event_processing() -> Self {
        Self::new(EVENT_PROCESSING_POOL, 32, 1024)
    }

    /// Default sizing for retry resumption.
    pub fn retry() -> Self {
        Self::new(RETRY_POOL, 8, 256)
    }
}

/// Point-in-time view of a pool's load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub active_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub remaining_capacity: usize,
    pub completed_tasks: u64,
}

impl PoolStats {
    /// Fraction of workers currently busy.
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        self.active_workers as f64 / self.max_workers as f64
    }

    /// Fraction of the wait queue currently occupied.
    pub fn queue_utilization(&self) -> f64 {
        let total = self.queue_size + self.remaining_capacity;
        if total == 0 {
            return 0.0;
        }
        self.queue_size as f64 / total as f64
    }

    /// Normalized [0, 1] load used for admission decisions.
    pub fn pressure_score(&self) -> f64 {
        (0.7 * self.utilization() + 0.3 * self.queue_utilization()).clamp(0.0, 1.0)
    }
}

struct PoolInner {
    name: String,
    max_workers: usize,
    queue_capacity: usize,
    permits: Arc<Semaphore>,
    occupied: AtomicUsize,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
}

impl PoolInner {
    fn publish(&self) {
        let name = self.name.clone();
        metrics::gauge!("pipeline_pool_active_workers", "pool" => name.clone())
            .set(self.active.load(Ordering::Relaxed) as f64);
        metrics::gauge!("pipeline_pool_queue_size", "pool" => name)
            .set(self.queued.load(Ordering::Relaxed) as f64);
    }
}

/// Holds one of the pool's `max_workers + queue_capacity` slots for the
/// whole life of a task, including a task aborted before it ever ran.
struct Reservation(Arc<PoolInner>);

impl Drop for Reservation {
    fn drop(&mut self) {
        self.0.occupied.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a task as waiting for a permit until dropped.
struct QueuedSlot(Arc<PoolInner>);

impl QueuedSlot {
    fn new(inner: Arc<PoolInner>) -> Self {
        inner.queued.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for QueuedSlot {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a task as running until dropped. Aborted tasks count as completed.
struct ActiveSlot(Arc<PoolInner>);

impl ActiveSlot {
    fn new(inner: Arc<PoolInner>) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        inner.publish();
        Self(inner)
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
        self.0.publish();
        metrics::counter!("pipeline_pool_completed_total", "pool" => self.0.name.clone())
            .increment(1);
    }
}

/// A named pool of tokio tasks with bounded concurrency and a bounded wait queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_workers)),
                name: config.name,
                max_workers: config.max_workers,
                queue_capacity: config.queue_capacity,
                occupied: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submits a future to the pool.
    ///
    /// The returned handle resolves with the future's output. Fails with
    /// [`PipelineError::PoolSaturated`] when every worker is busy and the
    /// wait queue is full.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let limit = self.inner.max_workers + self.inner.queue_capacity;
        if self
            .inner
            .occupied
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            let queued = self.inner.queued.load(Ordering::SeqCst);
            metrics::counter!("pipeline_pool_refused_total", "pool" => self.inner.name.clone())
                .increment(1);
            return Err(PipelineError::PoolSaturated {
                pool: self.inner.name.clone(),
                queued,
            });
        }

        let inner = Arc::clone(&self.inner);
        let reservation = Reservation(Arc::clone(&inner));
        let waiting = QueuedSlot::new(Arc::clone(&inner));
        Ok(tokio::spawn(async move {
            let _reservation = reservation;
            // The semaphore is never closed, so acquisition only waits.
            let permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
            drop(waiting);
            let _active = ActiveSlot::new(inner);
            let output = future.await;
            drop(permit);
            output
        }))
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.inner.queued.load(Ordering::SeqCst);
        PoolStats {
            name: self.inner.name.clone(),
            active_workers: self.inner.active.load(Ordering::SeqCst),
            max_workers: self.inner.max_workers,
            queue_size: queued,
            remaining_capacity: self.inner.queue_capacity.saturating_sub(queued),
            completed_tasks: self.inner.completed.load(Ordering::SeqCst),
        }
    }

    pub fn pressure_score(&self) -> f64 {
        self.stats().pressure_score()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn stats(active: usize, max: usize, queued: usize, remaining: usize) -> PoolStats {
        PoolStats {
            name: "test".to_string(),
            active_workers: active,
            max_workers: max,
            queue_size: queued,
            remaining_capacity: remaining,
            completed_tasks: 0,
        }
    }

    #[test]
    fn test_pressure_score_formula() {
        assert_eq!(stats(0, 4, 0, 10).pressure_score(), 0.0);
        assert!((stats(2, 4, 0, 10).pressure_score() - 0.35).abs() < 1e-9);
        assert!((stats(4, 4, 5, 5).pressure_score() - 0.85).abs() < 1e-9);
        assert!((stats(4, 4, 10, 0).pressure_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pressure_score_handles_empty_queue() {
        let s = stats(1, 2, 0, 0);
        assert_eq!(s.queue_utilization(), 0.0);
        assert!((s.pressure_score() - 0.35).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_spawn_runs_future_and_counts_completion() {
        let pool = WorkerPool::new(PoolConfig::new("test", 2, 4));
        let value = pool.spawn(async { 21 * 2 }).unwrap().await.unwrap();
        assert_eq!(value, 42);

        let stats = pool.stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.remaining_capacity, 4);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_queue_refuses_overflow() {
        let pool = WorkerPool::new(PoolConfig::new("bounded", 1, 1));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let running = pool
            .spawn(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        started_rx.await.unwrap();

        let waiting = pool.spawn(async { "second" }).unwrap();
        tokio::task::yield_now().await;

        let stats = pool.stats();
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.remaining_capacity, 0);
        assert!((stats.pressure_score() - 1.0).abs() < 1e-9);

        let refused = pool.spawn(async { "third" });
        assert!(matches!(
            refused,
            Err(PipelineError::PoolSaturated { ref pool, .. }) if pool == "bounded"
        ));

        release_tx.send(()).unwrap();
        running.await.unwrap();
        assert_eq!(waiting.await.unwrap(), "second");
        assert_eq!(pool.stats().completed_tasks, 2);
    }

    #[tokio::test]
    async fn test_aborted_task_releases_its_slot() {
        let pool = WorkerPool::new(PoolConfig::new("abort", 1, 0));
        let handle = pool
            .spawn(async { std::future::pending::<()>().await })
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().active_workers, 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(pool.stats().active_workers, 0);

        // The freed slot accepts new work.
        assert_eq!(pool.spawn(async { 1 }).unwrap().await.unwrap(), 1);
    }
}
