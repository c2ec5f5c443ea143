//! Terminal outcome of one event delivery.

use std::time::Duration;

use common::SequenceNumber;
use serde::Serialize;

use crate::backpressure::BackpressureLevel;
use crate::error::DispatchError;
use crate::handler::HandlerError;

/// Exactly one of these is produced for every delivery handed to the
/// dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The handler completed successfully.
    Succeeded { attempts: u32, elapsed: Duration },

    /// The event had already been accepted; the handler was not invoked.
    Duplicate {
        sequence: SequenceNumber,
        last_seen: SequenceNumber,
    },

    /// Backpressure refused admission.
    Rejected { level: BackpressureLevel },

    /// The event skipped ahead of its aggregate's expected sequence.
    Disordered {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The timeout elapsed before the retry-wrapped handler finished.
    TimedOut { timeout: Duration, elapsed: Duration },

    /// The handler failed on every permitted attempt.
    Failed { attempts: u32, error: HandlerError },
}

/// A delivery that counts as handled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Delivery {
    Processed { attempts: u32, elapsed_ms: u64 },
    Duplicate { sequence: SequenceNumber },
}

impl DispatchOutcome {
    /// Succeeded and Duplicate both count as success.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Succeeded { .. } | DispatchOutcome::Duplicate { .. }
        )
    }

    /// Handler attempts made for this delivery (zero when it never ran).
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Succeeded { attempts, .. }
            | DispatchOutcome::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Label used for logs and the `pipeline_dispatch_total` metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Succeeded { .. } => "succeeded",
            DispatchOutcome::Duplicate { .. } => "duplicate",
            DispatchOutcome::Rejected { .. } => "rejected",
            DispatchOutcome::Disordered { .. } => "disordered",
            DispatchOutcome::TimedOut { .. } => "timed_out",
            DispatchOutcome::Failed { .. } => "failed",
        }
    }

    /// Splits the outcome into a handled delivery or one of the four
    /// dispatch error kinds.
    pub fn into_result(self) -> Result<Delivery, DispatchError> {
        match self {
            DispatchOutcome::Succeeded { attempts, elapsed } => Ok(Delivery::Processed {
                attempts,
                elapsed_ms: elapsed.as_millis() as u64,
            }),
            DispatchOutcome::Duplicate { sequence, .. } => Ok(Delivery::Duplicate { sequence }),
            DispatchOutcome::Rejected { level } => {
                Err(DispatchError::BackpressureRejected { level })
            }
            DispatchOutcome::Disordered { expected, actual } => {
                Err(DispatchError::SequenceDisorder { expected, actual })
            }
            DispatchOutcome::TimedOut { timeout, elapsed } => {
                Err(DispatchError::Timeout { timeout, elapsed })
            }
            DispatchOutcome::Failed { attempts, error } => {
                Err(DispatchError::ProcessingFailed { attempts, error })
            }
        }
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
