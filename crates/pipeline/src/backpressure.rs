//! Load-based admission control.
//!
//! Load is the larger of in-flight occupancy (`in_flight / capacity`) and the
//! pressure score of a bound worker pool. Thresholds map load to a level:
//!
//! ```text
//! 0 ── Normal ── moderate ── Moderate ── high ── High ── critical ── Critical ── 1
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::pool::WorkerPool;

/// Coarse load classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl BackpressureLevel {
    /// The admission decision for this level.
    pub fn decision(&self) -> BackpressureDecision {
        match self {
            BackpressureLevel::Normal => BackpressureDecision::Proceed,
            BackpressureLevel::Moderate | BackpressureLevel::High => BackpressureDecision::Delay,
            BackpressureLevel::Critical => BackpressureDecision::Reject,
        }
    }

    /// Contribution of this level to the system health score.
    pub fn health_score(&self) -> f64 {
        match self {
            BackpressureLevel::Normal => 1.0,
            BackpressureLevel::Moderate => 0.7,
            BackpressureLevel::High => 0.4,
            BackpressureLevel::Critical => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureLevel::Normal => "normal",
            BackpressureLevel::Moderate => "moderate",
            BackpressureLevel::High => "high",
            BackpressureLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureDecision {
    Proceed,
    Delay,
    Reject,
}

impl BackpressureDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureDecision::Proceed => "proceed",
            BackpressureDecision::Delay => "delay",
            BackpressureDecision::Reject => "reject",
        }
    }
}

/// Capacity, thresholds (fractions of capacity) and per-level delays.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    pub capacity: usize,
    pub moderate_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
    pub moderate_delay: Duration,
    pub high_delay: Duration,
    /// Hint returned to callers while rejecting; never waited on internally.
    pub critical_delay: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            moderate_threshold: 0.6,
            high_threshold: 0.8,
            critical_threshold: 0.95,
            moderate_delay: Duration::from_millis(50),
            high_delay: Duration::from_millis(200),
            critical_delay: Duration::from_secs(1),
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let ordered = 0.0 < self.moderate_threshold
            && self.moderate_threshold < self.high_threshold
            && self.high_threshold < self.critical_threshold
            && self.critical_threshold <= 1.0;
        if !ordered {
            return Err(ConfigError::InvalidThresholds {
                moderate: self.moderate_threshold,
                high: self.high_threshold,
                critical: self.critical_threshold,
            });
        }
        // delay_for(High) never drops below the moderate delay.
        if self.moderate_delay.is_zero() {
            return Err(ConfigError::ZeroDelay);
        }
        Ok(())
    }

    /// Maps a load ratio to a level.
    pub fn level_for(&self, load: f64) -> BackpressureLevel {
        if load >= self.critical_threshold {
            BackpressureLevel::Critical
        } else if load >= self.high_threshold {
            BackpressureLevel::High
        } else if load >= self.moderate_threshold {
            BackpressureLevel::Moderate
        } else {
            BackpressureLevel::Normal
        }
    }

    /// Suggested delay for a level; grows with the level.
    pub fn delay_for(&self, level: BackpressureLevel) -> Duration {
        match level {
            BackpressureLevel::Normal => Duration::ZERO,
            BackpressureLevel::Moderate => self.moderate_delay,
            BackpressureLevel::High => self.high_delay.max(self.moderate_delay),
            BackpressureLevel::Critical => self.critical_delay,
        }
    }
}

/// Snapshot of the controller's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureStatus {
    pub level: BackpressureLevel,
    pub decision: BackpressureDecision,
    pub in_flight: usize,
    pub capacity: usize,
    pub load: f64,
    pub suggested_delay_ms: u64,
    pub proceeded: u64,
    pub delayed: u64,
    pub rejected: u64,
}

impl BackpressureStatus {
    pub fn suggested_delay(&self) -> Duration {
        Duration::from_millis(self.suggested_delay_ms)
    }
}

/// Decides whether new work may enter the pipeline.
///
/// `on_admitted` / `on_completed` are the only mutators of occupancy and
/// must be paired. [`BackpressureController::admit`] returns a guard that
/// performs the completion on drop.
#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    in_flight: AtomicUsize,
    pool: Option<WorkerPool>,
    proceeded: AtomicU64,
    delayed: AtomicU64,
    rejected: AtomicU64,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            in_flight: AtomicUsize::new(0),
            pool: None,
            proceeded: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Also derive load from the pressure score of `pool`.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current load ratio in [0, 1].
    pub fn load(&self) -> f64 {
        let occupancy = self.in_flight() as f64 / self.config.capacity as f64;
        let pool_pressure = self.pool.as_ref().map_or(0.0, WorkerPool::pressure_score);
        occupancy.max(pool_pressure).clamp(0.0, 1.0)
    }

    pub fn level(&self) -> BackpressureLevel {
        self.config.level_for(self.load())
    }

    /// Makes an admission decision for the current level and counts it.
    pub fn decide(&self) -> BackpressureDecision {
        self.assess().1
    }

    /// Like [`decide`](Self::decide), also returning the level the decision
    /// was made at.
    pub fn assess(&self) -> (BackpressureLevel, BackpressureDecision) {
        let level = self.level();
        let decision = level.decision();
        let counter = match decision {
            BackpressureDecision::Proceed => &self.proceeded,
            BackpressureDecision::Delay => &self.delayed,
            BackpressureDecision::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("pipeline_backpressure_decisions_total", "decision" => decision.as_str())
            .increment(1);
        (level, decision)
    }

    pub fn suggested_delay(&self) -> Duration {
        self.config.delay_for(self.level())
    }

    /// Records one admitted unit of work. Returns the new occupancy.
    pub fn on_admitted(&self) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("pipeline_backpressure_in_flight").set(now as f64);
        now
    }

    /// Records one completed unit of work. Returns the new occupancy.
    pub fn on_completed(&self) -> usize {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let now = match previous {
            Ok(previous) => previous - 1,
            Err(_) => {
                tracing::warn!("on_completed called without a matching admission");
                0
            }
        };
        metrics::gauge!("pipeline_backpressure_in_flight").set(now as f64);
        now
    }

    /// Admits one unit of work; completion is recorded when the guard drops.
    pub fn admit(self: &Arc<Self>) -> Admission {
        self.on_admitted();
        Admission {
            controller: Arc::clone(self),
        }
    }

    pub fn status(&self) -> BackpressureStatus {
        let level = self.level();
        BackpressureStatus {
            level,
            decision: level.decision(),
            in_flight: self.in_flight(),
            capacity: self.config.capacity,
            load: self.load(),
            suggested_delay_ms: self.config.delay_for(level).as_millis() as u64,
            proceeded: self.proceeded.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

/// One admitted unit of work. Dropping it calls `on_completed`.
#[derive(Debug)]
#[must_use = "dropping an Admission immediately completes it"]
pub struct Admission {
    controller: Arc<BackpressureController>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.controller.on_completed();
    }
}
