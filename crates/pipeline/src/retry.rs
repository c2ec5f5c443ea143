//! Bounded-attempt re-execution with backoff.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::error::ConfigError;
use crate::handler::HandlerError;
use crate::pool::WorkerPool;

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base` after every attempt.
    Fixed,
    /// `attempt * base`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown backoff kind: {other}")),
        }
    }
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

    pub fn new(max_attempts: u32, backoff: BackoffKind, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            base_delay,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, BackoffKind::Fixed, delay)
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts, BackoffKind::Linear, base_delay)
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts, BackoffKind::Exponential, base_delay)
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Linear => self.base_delay.saturating_mul(attempt),
            BackoffKind::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }
}

/// A successful execution and the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Every allowed attempt failed (or a non-retryable failure occurred).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: HandlerError,
}

#[derive(Debug, Default)]
struct RetryCounters {
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    first_attempt_successes: AtomicU64,
    successes_after_retry: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStatistics {
    pub executions: u64,
    pub attempts: u64,
    pub retries: u64,
    pub first_attempt_successes: u64,
    pub successes_after_retry: u64,
    pub exhausted: u64,
}

/// Aborts the wrapped task if the waiting side goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs an operation until it succeeds or the policy gives up.
///
/// The first attempt runs inline in the caller's task. Later attempts are
/// resumed on the retry pool (when one is configured) after an async sleep,
/// so no worker is held while waiting out a backoff delay. A panicking
/// attempt is reported as [`HandlerError::Panicked`] and ends the execution.
#[derive(Debug, Default)]
pub struct RetryCoordinator {
    pool: Option<WorkerPool>,
    counters: RetryCounters,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume retried attempts on `pool`.
    pub fn with_pool(pool: WorkerPool) -> Self {
        Self {
            pool: Some(pool),
            counters: RetryCounters::default(),
        }
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    #[tracing::instrument(skip_all, fields(max_attempts = policy.max_attempts, backoff = ?policy.backoff))]
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<Retried<T>, RetryExhausted>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Send + 'static,
    {
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            self.counters.attempts.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("pipeline_retry_attempts_total").increment(1);

            let result = if attempt == 1 {
                run_inline(operation()).await
            } else {
                self.resume(&operation).await
            };

            match result {
                Ok(value) => {
                    if attempt == 1 {
                        self.counters
                            .first_attempt_successes
                            .fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.counters
                            .successes_after_retry
                            .fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(attempts = attempt, "succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                    self.counters.exhausted.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("pipeline_retry_exhausted_total").increment(1);
                    tracing::warn!(attempts = attempt, %error, "retries exhausted");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => {
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(attempt, ?delay, %error, "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    self.counters.retries.fetch_add(1, Ordering::SeqCst);
                    attempt += 1;
                }
            }
        }
    }

    async fn resume<F, Fut, T>(&self, operation: &F) -> Result<T, HandlerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(pool) = &self.pool else {
            return run_inline(operation()).await;
        };
        match pool.spawn(operation()) {
            Ok(handle) => {
                let mut task = AbortOnDrop(handle);
                match (&mut task.0).await {
                    Ok(result) => result,
                    Err(join_error) => Err(HandlerError::Panicked(join_error.to_string())),
                }
            }
            Err(error) => {
                tracing::debug!(%error, "retry pool saturated, resuming inline");
                run_inline(operation()).await
            }
        }
    }

    pub fn statistics(&self) -> RetryStatistics {
        RetryStatistics {
            executions: self.counters.executions.load(Ordering::SeqCst),
            attempts: self.counters.attempts.load(Ordering::SeqCst),
            retries: self.counters.retries.load(Ordering::SeqCst),
            first_attempt_successes: self.counters.first_attempt_successes.load(Ordering::SeqCst),
            successes_after_retry: self.counters.successes_after_retry.load(Ordering::SeqCst),
            exhausted: self.counters.exhausted.load(Ordering::SeqCst),
        }
    }
}

/// Awaits one attempt in the current task, turning a panic into an error.
async fn run_inline<Fut, T>(attempt: Fut) -> Result<T, HandlerError>
where
    Fut: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
