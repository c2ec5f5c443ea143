//! Per-aggregate duplicate and out-of-order detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{AggregateId, DomainEvent, SequenceNumber};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Ordering state for one aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceRecord {
    /// The sequence number the aggregate should present next.
    pub expected: SequenceNumber,
    /// The last sequence number accepted in order.
    pub last_seen: SequenceNumber,
}

impl Default for SequenceRecord {
    fn default() -> Self {
        Self {
            expected: SequenceNumber::first(),
            last_seen: SequenceNumber::initial(),
        }
    }
}

/// Which of the three mutually exclusive cases an event fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceVerdict {
    InOrder,
    Duplicate,
    OutOfOrder,
}

impl SequenceVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceVerdict::InOrder => "in_order",
            SequenceVerdict::Duplicate => "duplicate",
            SequenceVerdict::OutOfOrder => "out_of_order",
        }
    }
}

/// Result of validating one event against its aggregate's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceValidation {
    pub verdict: SequenceVerdict,
    /// The sequence number the event carried.
    pub actual: SequenceNumber,
    /// The record as it was when the decision was made.
    pub record: SequenceRecord,
}

impl SequenceValidation {
    pub fn is_in_order(&self) -> bool {
        self.verdict == SequenceVerdict::InOrder
    }

    pub fn is_duplicate(&self) -> bool {
        self.verdict == SequenceVerdict::Duplicate
    }

    pub fn is_out_of_order(&self) -> bool {
        self.verdict == SequenceVerdict::OutOfOrder
    }

    pub fn expected(&self) -> SequenceNumber {
        self.record.expected
    }
}

#[derive(Debug, Default)]
struct SequenceCounters {
    validations: AtomicU64,
    in_order: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
}

/// Aggregate validation counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatistics {
    pub total_validations: u64,
    pub in_order: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub tracked_aggregates: usize,
}

impl SequenceStatistics {
    /// Share of validations that were in order; 1.0 before any validation.
    pub fn valid_rate(&self) -> f64 {
        if self.total_validations == 0 {
            return 1.0;
        }
        self.in_order as f64 / self.total_validations as f64
    }
}

/// Exclusive, FIFO-ordered hold on one aggregate's record.
///
/// Obtained from [`SequenceTracker::reserve`]; other callers for the same
/// aggregate wait until the slot is validated or dropped.
pub struct SequenceSlot {
    aggregate_id: AggregateId,
    record: OwnedMutexGuard<SequenceRecord>,
    counters: Arc<SequenceCounters>,
}

impl SequenceSlot {
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Current record without validating anything.
    pub fn record(&self) -> SequenceRecord {
        *self.record
    }

    /// Validates `event` and releases the slot.
    ///
    /// Only an in-order event advances the record. A gap leaves `last_seen`
    /// untouched until the missing events arrive.
    pub fn validate(mut self, event: &DomainEvent) -> SequenceValidation {
        debug_assert_eq!(event.aggregate_id(), &self.aggregate_id);

        let snapshot = *self.record;
        let actual = event.sequence();
        let verdict = if actual <= snapshot.last_seen {
            SequenceVerdict::Duplicate
        } else if actual > snapshot.expected {
            SequenceVerdict::OutOfOrder
        } else {
            self.record.last_seen = actual;
            self.record.expected = actual.next();
            SequenceVerdict::InOrder
        };

        self.counters.validations.fetch_add(1, Ordering::SeqCst);
        let counter = match verdict {
            SequenceVerdict::InOrder => &self.counters.in_order,
            SequenceVerdict::Duplicate => &self.counters.duplicates,
            SequenceVerdict::OutOfOrder => &self.counters.out_of_order,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("pipeline_sequence_validations_total", "result" => verdict.as_str())
            .increment(1);

        if verdict == SequenceVerdict::OutOfOrder {
            tracing::debug!(
                aggregate_id = %self.aggregate_id,
                expected = %snapshot.expected,
                %actual,
                "sequence gap detected"
            );
        }

        SequenceValidation {
            verdict,
            actual,
            record: snapshot,
        }
    }
}

/// Tracks the expected next sequence number of every aggregate seen so far.
///
/// Calls for the same aggregate are serialized in arrival order; calls for
/// different aggregates only contend on the map shard while the record is
/// looked up. Records live until [`SequenceTracker::forget`] is called.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    records: DashMap<AggregateId, Arc<Mutex<SequenceRecord>>>,
    counters: Arc<SequenceCounters>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, aggregate_id: &AggregateId) -> Arc<Mutex<SequenceRecord>> {
        if let Some(cell) = self.records.get(aggregate_id) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.records.entry(aggregate_id.clone()).or_default().value())
    }

    /// Waits for exclusive access to the aggregate's record, creating it on
    /// first sighting.
    pub async fn reserve(&self, aggregate_id: &AggregateId) -> SequenceSlot {
        let record = self.cell(aggregate_id).lock_owned().await;
        SequenceSlot {
            aggregate_id: aggregate_id.clone(),
            record,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Validates an event's sequence number against its aggregate's record.
    pub async fn validate(&self, event: &DomainEvent) -> SequenceValidation {
        self.reserve(event.aggregate_id()).await.validate(event)
    }

    /// Returns a copy of the aggregate's record, if it has been seen.
    pub async fn record(&self, aggregate_id: &AggregateId) -> Option<SequenceRecord> {
        let cell = self.records.get(aggregate_id).map(|c| Arc::clone(c.value()))?;
        let record = *cell.lock().await;
        Some(record)
    }

    /// Drops the aggregate's record. Returns true if one existed.
    pub fn forget(&self, aggregate_id: &AggregateId) -> bool {
        self.records.remove(aggregate_id).is_some()
    }

    pub fn statistics(&self) -> SequenceStatistics {
        SequenceStatistics {
            total_validations: self.counters.validations.load(Ordering::SeqCst),
            in_order: self.counters.in_order.load(Ordering::SeqCst),
            duplicates: self.counters.duplicates.load(Ordering::SeqCst),
            out_of_order: self.counters.out_of_order.load(Ordering::SeqCst),
            tracked_aggregates: self.records.len(),
        }
    }
}
