use common::DomainEvent;
use criterion::{Criterion, criterion_group, criterion_main};
use pipeline::{DispatchOptions, ResilientEventDispatcher, SequenceTracker, handler_fn};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn make_event(aggregate: &str, sequence: u64) -> DomainEvent {
    DomainEvent::builder()
        .event_type("OrderPlaced")
        .aggregate_id(aggregate)
        .sequence(sequence)
        .build()
        .unwrap()
}

fn make_dispatcher() -> Arc<ResilientEventDispatcher> {
    Arc::new(
        ResilientEventDispatcher::builder()
            .register("noop", handler_fn(|_event| async { Ok(()) }))
            .build()
            .unwrap(),
    )
}

fn bench_dispatch_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = make_dispatcher();
    let next = AtomicU64::new(1);

    c.bench_function("pipeline/dispatch_single_event", |b| {
        b.iter(|| {
            let sequence = next.fetch_add(1, Ordering::Relaxed);
            rt.block_on(async {
                dispatcher
                    .handle(make_event("ORD-1", sequence), "noop", DispatchOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_dispatch_100_aggregates(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("pipeline/dispatch_100_aggregates_concurrently", |b| {
        b.iter(|| {
            rt.block_on(async {
                let dispatcher = make_dispatcher();
                let handles: Vec<_> = (0..100)
                    .map(|n| {
                        dispatcher
                            .submit(
                                make_event(&format!("ORD-{n}"), 1),
                                "noop",
                                DispatchOptions::new(),
                            )
                            .unwrap()
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    });
}

fn bench_sequence_validation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tracker = SequenceTracker::new();
    let next = AtomicU64::new(1);

    c.bench_function("pipeline/sequence_validate", |b| {
        b.iter(|| {
            let sequence = next.fetch_add(1, Ordering::Relaxed);
            rt.block_on(async {
                tracker.validate(&make_event("ORD-1", sequence)).await;
            });
        });
    });
}

fn bench_system_health(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = make_dispatcher();
    rt.block_on(async {
        for sequence in 1..=100 {
            dispatcher
                .handle(make_event("ORD-1", sequence), "noop", DispatchOptions::new())
                .await
                .unwrap();
        }
    });

    c.bench_function("pipeline/system_health", |b| {
        b.iter(|| dispatcher.system_health());
    });
}

criterion_group!(
    benches,
    bench_dispatch_single_event,
    bench_dispatch_100_aggregates,
    bench_sequence_validation,
    bench_system_health
);
criterion_main!(benches);
