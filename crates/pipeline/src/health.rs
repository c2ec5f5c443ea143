//! Aggregated system health.

use serde::Serialize;

use crate::backpressure::BackpressureStatus;
use crate::monitor::ProcessingStatistics;
use crate::pool::PoolStats;
use crate::retry::RetryStatistics;
use crate::sequence::SequenceStatistics;

/// Minimum score for [`SystemHealth::is_healthy`].
pub const HEALTHY_THRESHOLD: f64 = 80.0;

// Weights already scaled to 0-100.
const SUCCESS_WEIGHT: f64 = 50.0;
const BACKPRESSURE_WEIGHT: f64 = 30.0;
const SEQUENCE_WEIGHT: f64 = 20.0;

/// Snapshot of every component plus a 0-100 score.
///
/// ```text
/// score = 100 * (0.5 * success_rate + 0.3 * backpressure_score + 0.2 * sequence_valid_rate)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub processing: ProcessingStatistics,
    pub retry: RetryStatistics,
    pub backpressure: BackpressureStatus,
    pub sequence: SequenceStatistics,
    pub pools: Vec<PoolStats>,
    pub score: f64,
    pub healthy: bool,
}

impl SystemHealth {
    pub fn compose(
        processing: ProcessingStatistics,
        retry: RetryStatistics,
        backpressure: BackpressureStatus,
        sequence: SequenceStatistics,
        pools: Vec<PoolStats>,
    ) -> Self {
        let score = SUCCESS_WEIGHT * processing.success_rate.clamp(0.0, 1.0)
            + BACKPRESSURE_WEIGHT * backpressure.level.health_score()
            + SEQUENCE_WEIGHT * sequence.valid_rate().clamp(0.0, 1.0);
        Self {
            processing,
            retry,
            backpressure,
            sequence,
            pools,
            score,
            healthy: score >= HEALTHY_THRESHOLD,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// The success-rate term, in [0, 1].
    pub fn success_term(&self) -> f64 {
        self.processing.success_rate
    }

    /// The backpressure term, in [0, 1].
    pub fn backpressure_term(&self) -> f64 {
        self.backpressure.level.health_score()
    }

    /// The sequence-validity term, in [0, 1].
    pub fn sequence_term(&self) -> f64 {
        self.sequence.valid_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{BackpressureDecision, BackpressureLevel};

    fn processing(succeeded: u64, failed: u64) -> ProcessingStatistics {
        let completed = succeeded + failed;
        ProcessingStatistics {
            total: completed,
            succeeded,
            failed,
            timed_out: 0,
            active: 0,
            success_rate: if completed == 0 {
                1.0
            } else {
                succeeded as f64 / completed as f64
            },
            total_processing_ms: 0,
            average_processing_ms: 0.0,
            handlers: Vec::new(),
        }
    }

    fn backpressure(level: BackpressureLevel) -> BackpressureStatus {
        BackpressureStatus {
            level,
            decision: level.decision(),
            in_flight: 0,
            capacity: 100,
            load: 0.0,
            suggested_delay_ms: 0,
            proceeded: 0,
            delayed: 0,
            rejected: 0,
        }
    }

    fn sequence(in_order: u64, out_of_order: u64) -> SequenceStatistics {
        SequenceStatistics {
            total_validations: in_order + out_of_order,
            in_order,
            duplicates: 0,
            out_of_order,
            tracked_aggregates: 1,
        }
    }

    fn retry() -> RetryStatistics {
        RetryStatistics {
            executions: 0,
            attempts: 0,
            retries: 0,
            first_attempt_successes: 0,
            successes_after_retry: 0,
            exhausted: 0,
        }
    }

    #[test]
    fn test_idle_system_scores_full_marks() {
        let health = SystemHealth::compose(
            processing(0, 0),
            retry(),
            backpressure(BackpressureLevel::Normal),
            sequence(0, 0),
            Vec::new(),
        );
        assert!((health.score - 100.0).abs() < 1e-9);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_weighted_score() {
        // 0.5 * 0.5 + 0.3 * 0.7 + 0.2 * 0.75 = 0.61
        let health = SystemHealth::compose(
            processing(1, 1),
            retry(),
            backpressure(BackpressureLevel::Moderate),
            sequence(3, 1),
            Vec::new(),
        );
        assert!((health.score - 61.0).abs() < 1e-9);
        assert!(!health.is_healthy());
        assert_eq!(health.backpressure.decision, BackpressureDecision::Delay);
    }

    #[test]
    fn test_healthy_threshold_is_inclusive() {
        // 0.5 * 1.0 + 0.3 * 1.0 + 0.2 * 0.0 = 0.8
        let health = SystemHealth::compose(
            processing(4, 0),
            retry(),
            backpressure(BackpressureLevel::Normal),
            sequence(0, 2),
            Vec::new(),
        );
        assert!((health.score - 80.0).abs() < 1e-9);
        assert_eq!(health.sequence_term(), 0.0);
        assert_eq!(health.success_term(), 1.0);
        assert_eq!(health.backpressure_term(), 1.0);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_critical_backpressure_alone_is_unhealthy() {
        let health = SystemHealth::compose(
            processing(0, 0),
            retry(),
            backpressure(BackpressureLevel::Critical),
            sequence(0, 0),
            Vec::new(),
        );
        // 0.5 + 0.03 + 0.2
        assert!((health.score - 73.0).abs() < 1e-9);
        assert!(!health.is_healthy());
    }
}
