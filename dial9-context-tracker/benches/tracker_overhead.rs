use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use dial9_context_tracker::context::{
    ContextTracker, ContextTracking, IntervalSequencePruner, ManualClock, MaskedTick,
    TrackerConfig, TrackerFactory, parse,
};
use std::sync::Arc;

fn bench_transitions(c: &mut Criterion) {
    let factory = TrackerFactory::new(TrackerConfig::default()).unwrap();

    c.bench_function("activate_deactivate", |b| {
        b.iter_batched(
            || factory.create().unwrap(),
            |tracker| {
                for _ in 0..64 {
                    tracker.activate();
                    tracker.maybe_deactivate();
                }
                tracker
            },
            BatchSize::SmallInput,
        );
    });
}

/// Record `windows` closed windows on each of `threads` threads.
fn record(tracker: &ContextTracker, clock: &ManualClock, threads: u64, windows: i64) {
    let mut tick = 0;
    for thread in 0..threads {
        for _ in 0..windows {
            tracker.activate_context(thread, tick + 1_000);
            tracker.deactivate_context(thread, tick + 40_000, false);
            tick += 50_000;
        }
    }
    clock.set(tick);
}

fn bench_persist(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::default());
    let factory = TrackerFactory::with_clock(TrackerConfig::default(), clock.clone()).unwrap();

    c.bench_function("persist_8x32", |b| {
        b.iter_batched(
            || {
                let tracker = factory.create().unwrap();
                record(&tracker, &clock, 8, 32);
                tracker
            },
            |tracker| black_box(tracker.persist()),
            BatchSize::SmallInput,
        );
    });

    let tracker = factory.create().unwrap();
    record(&tracker, &clock, 8, 32);
    let blob = tracker.persist().unwrap();
    c.bench_function("parse_8x32", |b| b.iter(|| black_box(parse(black_box(&blob)))));
}

fn bench_prune(c: &mut Criterion) {
    let pruner = IntervalSequencePruner::new();
    let raw: Vec<i64> = (0..1024i64)
        .flat_map(|i| {
            [
                MaskedTick::activation(i * 100).raw(),
                MaskedTick::deactivation(i * 100 + 60, i % 3 == 0).raw(),
            ]
        })
        .collect();

    c.bench_function("prune_1024", |b| {
        b.iter(|| black_box(pruner.prune(raw.iter().copied(), 1024 * 100)))
    });
}

criterion_group!(benches, bench_transitions, bench_persist, bench_prune);
criterion_main!(benches);
