//! Pipeline configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::backpressure::BackpressureConfig;
use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::retry::{BackoffKind, RetryPolicy};

/// Default per-delivery timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one dispatcher and its components.
///
/// Reads from environment variables (unset or unparsable values keep the default):
/// - `PIPELINE_TIMEOUT_MS` (default: `30000`)
/// - `PIPELINE_RETRY_MAX_ATTEMPTS`, `PIPELINE_RETRY_BACKOFF` (`fixed|linear|exponential`),
///   `PIPELINE_RETRY_BASE_DELAY_MS`, `PIPELINE_RETRY_MAX_DELAY_MS`
/// - `PIPELINE_CAPACITY`, `PIPELINE_THRESHOLD_MODERATE`, `PIPELINE_THRESHOLD_HIGH`,
///   `PIPELINE_THRESHOLD_CRITICAL`
/// - `PIPELINE_DELAY_MODERATE_MS`, `PIPELINE_DELAY_HIGH_MS`, `PIPELINE_DELAY_CRITICAL_MS`
/// - `PIPELINE_EVENT_WORKERS`, `PIPELINE_EVENT_QUEUE`, `PIPELINE_RETRY_WORKERS`,
///   `PIPELINE_RETRY_QUEUE`
/// - `PIPELINE_CANCEL_ON_TIMEOUT` (default: `true`)
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub default_timeout: Duration,
    pub default_retry: RetryPolicy,
    pub backpressure: BackpressureConfig,
    pub event_pool: PoolConfig,
    pub retry_pool: PoolConfig,
    /// Abort the handler task when its delivery times out.
    pub cancel_on_timeout: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            default_retry: RetryPolicy::default(),
            backpressure: BackpressureConfig::default(),
            event_pool: PoolConfig::event_processing(),
            retry_pool: PoolConfig::retry(),
            cancel_on_timeout: true,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key);

        let millis = |key: &str, default: Duration| {
            parsed::<u64>(get(key)).map_or(default, Duration::from_millis)
        };

        let default_retry = RetryPolicy {
            max_attempts: parsed(get("PIPELINE_RETRY_MAX_ATTEMPTS"))
                .unwrap_or(defaults.default_retry.max_attempts),
            backoff: parsed::<BackoffKind>(get("PIPELINE_RETRY_BACKOFF"))
                .unwrap_or(defaults.default_retry.backoff),
            base_delay: millis(
                "PIPELINE_RETRY_BASE_DELAY_MS",
                defaults.default_retry.base_delay,
            ),
            max_delay: millis(
                "PIPELINE_RETRY_MAX_DELAY_MS",
                defaults.default_retry.max_delay,
            ),
        };

        let bp = &defaults.backpressure;
        let backpressure = BackpressureConfig {
            capacity: parsed(get("PIPELINE_CAPACITY")).unwrap_or(bp.capacity),
            moderate_threshold: parsed(get("PIPELINE_THRESHOLD_MODERATE"))
                .unwrap_or(bp.moderate_threshold),
            high_threshold: parsed(get("PIPELINE_THRESHOLD_HIGH")).unwrap_or(bp.high_threshold),
            critical_threshold: parsed(get("PIPELINE_THRESHOLD_CRITICAL"))
                .unwrap_or(bp.critical_threshold),
            moderate_delay: millis("PIPELINE_DELAY_MODERATE_MS", bp.moderate_delay),
            high_delay: millis("PIPELINE_DELAY_HIGH_MS", bp.high_delay),
            critical_delay: millis("PIPELINE_DELAY_CRITICAL_MS", bp.critical_delay),
        };

        let event_pool = PoolConfig {
            max_workers: parsed(get("PIPELINE_EVENT_WORKERS"))
                .unwrap_or(defaults.event_pool.max_workers),
            queue_capacity: parsed(get("PIPELINE_EVENT_QUEUE"))
                .unwrap_or(defaults.event_pool.queue_capacity),
            ..defaults.event_pool.clone()
        };
        let retry_pool = PoolConfig {
            max_workers: parsed(get("PIPELINE_RETRY_WORKERS"))
                .unwrap_or(defaults.retry_pool.max_workers),
            queue_capacity: parsed(get("PIPELINE_RETRY_QUEUE"))
                .unwrap_or(defaults.retry_pool.queue_capacity),
            ..defaults.retry_pool.clone()
        };

        Self {
            default_timeout: millis("PIPELINE_TIMEOUT_MS", defaults.default_timeout),
            default_retry,
            backpressure,
            event_pool,
            retry_pool,
            cancel_on_timeout: parsed(get("PIPELINE_CANCEL_ON_TIMEOUT"))
                .unwrap_or(defaults.cancel_on_timeout),
        }
    }

    /// Rejects settings the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        self.default_retry.validate()?;
        self.backpressure.validate()?;
        for pool in [&self.event_pool, &self.retry_pool] {
            if pool.max_workers == 0 {
                return Err(ConfigError::EmptyPool(pool.name.clone()));
            }
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.default_retry, RetryPolicy::default());
        assert_eq!(config.event_pool.name, "event-processing");
        assert_eq!(config.retry_pool.name, "retry");
        assert!(config.cancel_on_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_lookup_yields_defaults() {
        assert_eq!(
            PipelineConfig::from_lookup(|_| None),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_TIMEOUT_MS", "1500"),
            ("PIPELINE_RETRY_MAX_ATTEMPTS", "5"),
            ("PIPELINE_RETRY_BACKOFF", "linear"),
            ("PIPELINE_RETRY_BASE_DELAY_MS", "20"),
            ("PIPELINE_CAPACITY", "10"),
            ("PIPELINE_THRESHOLD_CRITICAL", "0.9"),
            ("PIPELINE_DELAY_HIGH_MS", "300"),
            ("PIPELINE_EVENT_WORKERS", "4"),
            ("PIPELINE_RETRY_QUEUE", "16"),
            ("PIPELINE_CANCEL_ON_TIMEOUT", "false"),
        ]));

        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.default_retry.max_attempts, 5);
        assert_eq!(config.default_retry.backoff, BackoffKind::Linear);
        assert_eq!(config.default_retry.base_delay, Duration::from_millis(20));
        assert_eq!(config.backpressure.capacity, 10);
        assert_eq!(config.backpressure.critical_threshold, 0.9);
        assert_eq!(config.backpressure.high_delay, Duration::from_millis(300));
        assert_eq!(config.event_pool.max_workers, 4);
        assert_eq!(config.event_pool.name, "event-processing");
        assert_eq!(config.retry_pool.queue_capacity, 16);
        assert!(!config.cancel_on_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_TIMEOUT_MS", "soon"),
            ("PIPELINE_RETRY_BACKOFF", "quadratic"),
            ("PIPELINE_CAPACITY", "-3"),
        ]));
        let defaults = PipelineConfig::default();
        assert_eq!(config.default_timeout, defaults.default_timeout);
        assert_eq!(config.default_retry.backoff, defaults.default_retry.backoff);
        assert_eq!(config.backpressure.capacity, defaults.backpressure.capacity);
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        let zero_timeout = PipelineConfig {
            default_timeout: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert_eq!(zero_timeout.validate(), Err(ConfigError::ZeroTimeout));

        let no_workers = PipelineConfig::from_lookup(lookup(&[("PIPELINE_RETRY_WORKERS", "0")]));
        assert_eq!(
            no_workers.validate(),
            Err(ConfigError::EmptyPool("retry".to_string()))
        );

        let inverted = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_THRESHOLD_MODERATE", "0.9"),
            ("PIPELINE_THRESHOLD_HIGH", "0.5"),
        ]));
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));

        let no_attempts =
            PipelineConfig::from_lookup(lookup(&[("PIPELINE_RETRY_MAX_ATTEMPTS", "0")]));
        assert_eq!(no_attempts.validate(), Err(ConfigError::ZeroAttempts));

        let no_delay = PipelineConfig::from_lookup(lookup(&[("PIPELINE_DELAY_MODERATE_MS", "0")]));
        assert_eq!(no_delay.validate(), Err(ConfigError::ZeroDelay));
    }
}
