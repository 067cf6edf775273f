use assert2::check;
use dial9_context_tracker::context::{
    AllocatorKind, Clock, ContextTracker, ContextTracking, ManualClock, TrackerConfig,
    TrackerFactory, parse,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn manual_factory(config: TrackerConfig) -> (TrackerFactory, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let factory = TrackerFactory::with_clock(config, clock.clone()).unwrap();
    (factory, clock)
}

/// Check that every thread's windows are well formed and in order.
fn check_windows_are_ordered(blob: &[u8]) {
    let decoded = parse(blob).unwrap();
    for thread in &decoded.threads {
        let mut previous_end = i64::MIN;
        for interval in &thread.intervals {
            check!(interval.start_ticks < interval.end_ticks);
            check!(interval.start_ticks >= previous_end);
            check!(interval.start_ns <= interval.end_ns);
            previous_end = interval.end_ticks;
        }
    }
}

#[test]
fn test_windows_survive_persist_and_parse() {
    init_logging();
    let (factory, clock) = manual_factory(TrackerConfig::default());
    clock.set(10_000);
    let tracker = factory.create().unwrap();

    tracker.activate_context(1, 10_100);
    tracker.deactivate_context(1, 10_400, true);
    tracker.activate_context(1, 10_450);
    tracker.deactivate_context(1, 10_900, false);
    tracker.activate_context(2, 11_000);
    tracker.deactivate_context(2, 12_000, false);
    clock.set(20_000);

    let blob = tracker.persist().unwrap();
    let decoded = parse(&blob).unwrap();
    check!(!decoded.truncated);
    check!(decoded.tick_multiplier == 1000);
    // the short gap after a tentative deactivation is merged into one window
    check!(decoded.triples().collect::<Vec<_>>() == vec![(1, 100, 900), (2, 1000, 2000)]);
    let first = decoded.threads[0].intervals[0];
    check!(first.start_ns == decoded.base_ns + 100);
    check!(first.end_ns == decoded.base_ns + 900);
}

#[test]
fn test_open_window_persists_identically_until_new_events() {
    let (factory, clock) = manual_factory(TrackerConfig::default());
    let tracker = factory.create().unwrap();
    tracker.activate_context(3, 50);
    clock.set(500);

    let first = tracker.persist().unwrap();
    clock.set(5_000);
    let second = tracker.persist().unwrap();
    check!(first[..] == second[..]);
    check!(parse(&first).unwrap().triples().collect::<Vec<_>>() == vec![(3, 50, 500)]);

    tracker.deactivate_context(3, 6_000, false);
    let third = tracker.persist().unwrap();
    check!(first[..] != third[..]);
    check!(parse(&third).unwrap().triples().collect::<Vec<_>>() == vec![(3, 50, 6_000)]);
}

#[test]
fn test_release_lifecycle() {
    let (factory, _clock) = manual_factory(TrackerConfig::default());
    let free_before = factory.allocator().free_chunks();

    let persisted = factory.create().unwrap();
    persisted.activate_context(1, 10);
    persisted.deactivate_context(1, 20, false);
    let blob = persisted.persist().unwrap();
    check!(factory.allocator().free_chunks() < free_before);

    check!(persisted.release());
    check!(!persisted.release());
    check!(factory.allocator().free_chunks() == free_before);
    check!(persisted.persist().unwrap()[..] == blob[..]);

    // events after release are dropped
    persisted.activate_context(1, 30);
    check!(persisted.persist().unwrap()[..] == blob[..]);

    let never_persisted = factory.create().unwrap();
    never_persisted.activate_context(1, 10);
    check!(ContextTracking::release(never_persisted.as_ref()));
    check!(never_persisted.persist().is_none());
    check!(factory.allocator().free_chunks() == free_before);
}

#[test]
fn test_blob_respects_size_limit() {
    init_logging();
    let (factory, clock) = manual_factory(TrackerConfig::default().with_max_data_size(64));
    let tracker = factory.create().unwrap();
    let mut tick = 0;
    for thread in 0..10u64 {
        for _ in 0..20 {
            tracker.activate_context(thread, tick + 100_000);
            tracker.deactivate_context(thread, tick + 250_000, false);
            tick += 1_000_000;
        }
    }
    clock.set(tick);

    let blob = tracker.persist().unwrap();
    check!(blob.len() <= 64);
    let decoded = parse(&blob).unwrap();
    check!(decoded.truncated);
    check!(decoded.interval_count() > 0);
    check!(tracker.is_truncated());
    check_windows_are_ordered(&blob);
}

#[test]
fn test_thread_limit_marks_truncation() {
    let (factory, clock) = manual_factory(TrackerConfig::default().with_max_threads(2));
    let tracker = factory.create().unwrap();
    for thread in 1..=3u64 {
        tracker.activate_context(thread, 10);
        tracker.deactivate_context(thread, 20, false);
    }
    clock.set(100);
    check!(tracker.thread_count() == 2);

    let decoded = parse(&tracker.persist().unwrap()).unwrap();
    check!(decoded.truncated);
    let ids: Vec<u64> = decoded.threads.iter().map(|t| t.thread_id).collect();
    check!(ids == vec![1, 2]);
}

fn exhaust_and_reuse(kind: AllocatorKind) {
    let config = TrackerConfig::default()
        .with_allocator(kind)
        .with_chunk_size(512)
        .with_memory_limit(8 * 512)
        .with_max_threads(32);
    let (factory, clock) = manual_factory(config);
    let total = factory.allocator().total_chunks();
    check!(total == 8);

    let tracker = factory.create().unwrap();
    // one chunk per thread
    for thread in 0..12u64 {
        tracker.activate_context(thread, 10);
        tracker.deactivate_context(thread, 20, false);
    }
    clock.set(100);
    check!(factory.allocator().free_chunks() == 0);
    check!(tracker.is_truncated());
    let decoded = parse(&tracker.persist().unwrap()).unwrap();
    check!(decoded.truncated);
    check!(decoded.threads.len() == 8);

    check!(tracker.release());
    check!(factory.allocator().free_chunks() == total);

    let next = factory.create().unwrap();
    next.activate_context(1, 200);
    next.deactivate_context(1, 300, false);
    check!(!next.is_truncated());
    check!(parse(&next.persist().unwrap()).unwrap().interval_count() == 1);
}

#[test]
fn test_heap_allocator_exhaustion_and_reuse() {
    exhaust_and_reuse(AllocatorKind::Heap);
}

#[cfg(unix)]
#[test]
fn test_direct_allocator_exhaustion_and_reuse() {
    exhaust_and_reuse(AllocatorKind::Direct);
}

#[test]
fn test_trackers_from_many_threads() {
    let factory = TrackerFactory::new(TrackerConfig::default()).unwrap();
    let tracker = factory.create().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    tracker.activate();
                    std::thread::sleep(Duration::from_micros(50));
                    tracker.deactivate();
                    std::thread::sleep(Duration::from_micros(50));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    check!(tracker.thread_count() == 4);
    let blob = tracker.persist().unwrap();
    let decoded = parse(&blob).unwrap();
    check!(!decoded.truncated);
    check!(decoded.threads.len() == 4);
    check!(decoded.interval_count() == 80);
    check_windows_are_ordered(&blob);
}

#[test]
fn test_concurrent_transitions_persist_and_release() {
    init_logging();
    let factory = TrackerFactory::new(TrackerConfig::default()).unwrap();
    let total = factory.allocator().total_chunks();
    let tracker = factory.create().unwrap();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    tracker.activate();
                    tracker.deactivate();
                }
            })
        })
        .collect();
    let persister = {
        let tracker = tracker.clone();
        std::thread::spawn(move || {
            let mut blobs = 0;
            while !tracker.is_released() {
                if let Some(blob) = tracker.persist() {
                    assert!(parse(&blob).is_ok());
                    blobs += 1;
                }
            }
            blobs
        })
    };
    std::thread::sleep(Duration::from_millis(2));
    let releasers: Vec<_> = (0..2)
        .map(|_| {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.release())
        })
        .collect();

    let released: usize = releasers
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    for h in writers {
        h.join().unwrap();
    }
    persister.join().unwrap();

    check!(released == 1);
    check!(tracker.is_released());
    check!(tracker.thread_count() == 0);
    check!(factory.in_flight() == 0);
    check!(factory.allocator().free_chunks() == total);
}

#[test]
fn test_dropped_transition_after_persist_marks_next_blob() {
    let config = TrackerConfig::default()
        .with_chunk_size(512)
        .with_memory_limit(2 * 512);
    let (factory, clock) = manual_factory(config);
    let tracker = factory.create().unwrap();
    for thread in 1..=2u64 {
        tracker.activate_context(thread, 10);
        tracker.deactivate_context(thread, 20, false);
    }
    clock.set(100);
    check!(!parse(&tracker.persist().unwrap()).unwrap().truncated);

    // no chunk left for a third thread
    tracker.activate_context(3, 30);
    check!(tracker.is_truncated());
    let decoded = parse(&tracker.persist().unwrap()).unwrap();
    check!(decoded.truncated);
    check!(decoded.interval_count() == 2);
}

#[test]
fn test_active_tracker_survives_stale_neighbour_bucket() {
    let config = TrackerConfig::default()
        .with_inactivity_timeout(Duration::from_millis(100))
        .with_expiration_granularity(Duration::from_millis(10));
    let (factory, clock) = manual_factory(config);
    clock.set(10_000_000);
    let neighbour = factory.create().unwrap();
    clock.set(0);
    let busy = factory.create().unwrap();
    clock.set(120_000_000);
    busy.activate_context(1, 120_000_000);

    clock.set(125_000_000);
    factory.expiration().process_cleanup();
    check!(neighbour.is_released());
    check!(!busy.is_released());

    clock.set(230_000_000);
    factory.expiration().process_cleanup();
    check!(busy.is_released());
    check!(factory.in_flight() == 0);
}

#[test]
fn test_background_cleanup_releases_idle_trackers() {
    init_logging();
    let config = TrackerConfig::default()
        .with_inactivity_timeout(Duration::from_millis(50))
        .with_expiration_granularity(Duration::from_millis(10));
    let factory = TrackerFactory::new(config).unwrap();
    let _cleanup = factory.start_cleanup().unwrap();

    let idle = factory.create().unwrap();
    idle.activate();
    idle.deactivate();
    let created = Instant::now();
    check!(factory.in_flight() == 1);

    let deadline = created + Duration::from_secs(5);
    while !idle.is_released() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    check!(idle.is_released());
    // timeout plus one bucket, with slack for the cleanup period
    check!(created.elapsed() >= Duration::from_millis(50));
    check!(factory.in_flight() == 0);
    check!(factory.allocator().free_chunks() == factory.allocator().total_chunks());
}

#[test]
fn test_max_in_flight_recovers_after_release() {
    let (factory, _clock) = manual_factory(TrackerConfig::default().with_max_in_flight(2));
    let a = factory.create().unwrap();
    let b = factory.create_with_initial_activation(7).unwrap();
    check!(factory.create().is_none());

    drop(a);
    check!(factory.in_flight() == 1);
    let c: Arc<ContextTracker> = factory.create().unwrap();
    check!(b.release());
    check!(factory.in_flight() == 1);
    drop(c);
    check!(factory.in_flight() == 0);
}

#[test]
fn test_config_from_environment_lookup() {
    let config = TrackerConfig::from_lookup(|key| match key {
        "DIAL9_CONTEXT_MAX_SIZE" => Some("256".to_string()),
        "DIAL9_CONTEXT_ALLOCATOR" => Some("heap".to_string()),
        _ => None,
    })
    .unwrap();
    let (factory, clock) = manual_factory(config);
    check!(factory.config().max_data_size == 256);
    check!(clock.frequency() == 1_000_000_000);
}
