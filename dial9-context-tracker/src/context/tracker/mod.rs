//! Per-span context tracking.
//!
//! A [`ContextTracker`] records when a span's context becomes active or
//! inactive on each thread and turns that log into a compact, size-capped
//! blob on [`persist`](ContextTracker::persist). Trackers come from a
//! [`TrackerFactory`], which owns the pools shared by all of them.
//!
//! ## Truncation
//! Threads are encoded in the order they were first seen, intervals in time
//! order. The first interval that would push the blob over `max_data_size`
//! ends encoding; everything after it is dropped and the truncated flag is
//! set. The blob never exceeds the limit.

pub(crate) mod log;
mod thread_map;

use crate::context::alloc::Allocator;
use crate::context::clock::{Clock, MonotonicClock, current_thread_id, epoch_nanos};
use crate::context::config::TrackerConfig;
use crate::context::encoder::IntervalEncoder;
use crate::context::error::Result;
use crate::context::expiration::{CleanupGuard, Expirable, ExpirationTracker};
use crate::context::pruner::{IntervalSequencePruner, MaskedTick};
use crate::context::sequence::{AddResult, LongSequence};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use self::log::warn_ratelimited;
use self::thread_map::{Slot, ThreadMap};

/// What the span lifecycle needs from a tracker.
pub trait ContextTracking: Send + Sync {
    /// The span became active on the calling thread.
    fn activate(&self);

    /// The span stopped being active on the calling thread.
    fn deactivate(&self);

    /// The span may stop being active on the calling thread; an activation
    /// that follows retracts this.
    fn maybe_deactivate(&self);

    fn persist(&self) -> Option<Arc<[u8]>>;

    fn release(&self) -> bool;
}

struct Persisted {
    /// Transition count the blob was encoded from.
    generation: u64,
    blob: Arc<[u8]>,
}

pub struct ContextTracker {
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    pruner: IntervalSequencePruner,
    threads: ThreadMap,
    start_ticks: i64,
    base_nanos: u64,
    max_data_size: usize,
    max_threads: usize,
    /// Raw per-thread storage in bytes, see [`ContextTracker::new`].
    storage_limit: usize,
    initial_activation: Option<(u64, i64)>,
    initialized: AtomicBool,
    released: AtomicBool,
    truncated: AtomicBool,
    generation: AtomicU64,
    persisted: ArcSwapOption<Persisted>,
    /// Serializes encoding with the teardown in `release`.
    persist_lock: Mutex<()>,
    expirable: OnceLock<Expirable>,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl std::fmt::Debug for ContextTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTracker")
            .field("threads", &self.threads.len())
            .field("start_ticks", &self.start_ticks)
            .field("released", &self.is_released())
            .field("truncated", &self.is_truncated())
            .finish()
    }
}

impl ContextTracker {
    /// Create a tracker starting now.
    ///
    /// With `initial_thread` set, an activation on that thread at the
    /// creation tick is recorded lazily, right before the first transition or
    /// persist.
    pub fn new(
        allocator: Arc<dyn Allocator>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
        initial_thread: Option<u64>,
    ) -> Self {
        let start_ticks = clock.ticks();
        Self {
            allocator,
            pruner: IntervalSequencePruner::new(),
            threads: ThreadMap::default(),
            start_ticks,
            base_nanos: epoch_nanos(),
            max_data_size: config.max_data_size,
            max_threads: config.max_threads,
            // one raw slot per byte of output
            storage_limit: config.max_data_size.saturating_mul(8),
            initial_activation: initial_thread.map(|id| (id, start_ticks)),
            initialized: AtomicBool::new(false),
            released: AtomicBool::new(false),
            truncated: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            persisted: ArcSwapOption::empty(),
            persist_lock: Mutex::new(()),
            expirable: OnceLock::new(),
            in_flight: None,
            clock,
        }
    }

    fn with_in_flight(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.in_flight = Some(counter);
        self
    }

    /// Record an activation of `thread_id` at the absolute `tick`.
    pub fn activate_context(&self, thread_id: u64, tick: i64) {
        self.store_delayed_activation();
        self.store(thread_id, MaskedTick::activation(self.relative(tick)), true);
    }

    /// Record a deactivation of `thread_id` at the absolute `tick`.
    ///
    /// Deactivations ignore the storage limit so open windows can close.
    pub fn deactivate_context(&self, thread_id: u64, tick: i64, tentative: bool) {
        self.store_delayed_activation();
        self.store(
            thread_id,
            MaskedTick::deactivation(self.relative(tick), tentative),
            false,
        );
    }

    fn relative(&self, tick: i64) -> i64 {
        tick.wrapping_sub(self.start_ticks).max(0)
    }

    fn store_delayed_activation(&self) {
        let Some((thread_id, tick)) = self.initial_activation else {
            return;
        };
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!(thread_id, "storing delayed activation");
            self.store(thread_id, MaskedTick::activation(self.relative(tick)), true);
        }
    }

    fn store(&self, thread_id: u64, value: MaskedTick, obey_limit: bool) {
        if self.is_released() {
            return;
        }
        let sequence = match self.threads.get_or_insert(thread_id, self.max_threads, || {
            LongSequence::with_limit(self.allocator.clone(), self.storage_limit)
        }) {
            Slot::Existing(seq) | Slot::Created(seq) => seq,
            Slot::Closed => return,
            Slot::Full => {
                if self.mark_truncated() {
                    warn_ratelimited!(
                        max_threads = self.max_threads,
                        "context thread limit reached, losing tracing context data"
                    );
                }
                return;
            }
        };
        let added = sequence.lock().push(value.raw(), obey_limit);
        match added {
            AddResult::Added(_) => {
                self.generation.fetch_add(1, Ordering::AcqRel);
                if let Some(expirable) = self.expirable.get() {
                    expirable.touch();
                }
            }
            AddResult::Released => {
                warn_ratelimited!(
                    "adding a transition to an already released context, losing tracing context data"
                );
            }
            AddResult::LimitReached => {
                if self.mark_truncated() {
                    warn_ratelimited!(
                        limit = self.max_data_size,
                        "context buffer size limit reached, losing tracing context data"
                    );
                }
            }
            AddResult::Exhausted => {
                if self.mark_truncated() {
                    warn_ratelimited!(
                        free_chunks = self.allocator.free_chunks(),
                        "context buffer pool is full, losing tracing context data"
                    );
                }
            }
        }
    }

    /// Set the sticky truncated flag. Returns `true` for the first caller,
    /// which also invalidates the cached blob so the next persist reports it.
    fn mark_truncated(&self) -> bool {
        let first = !self.truncated.swap(true, Ordering::AcqRel);
        if first {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    /// Encode the recorded intervals.
    ///
    /// Repeated calls without new transitions return the same bytes. After
    /// [`release`](Self::release) the last encoded blob is returned, or
    /// `None` if there never was one.
    pub fn persist(&self) -> Option<Arc<[u8]>> {
        let _persisting = self.persist_lock.lock();
        if self.is_released() {
            return self.persisted.load_full().map(|p| p.blob.clone());
        }
        self.store_delayed_activation();
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cached) = self.persisted.load_full()
            && cached.generation == generation
        {
            return Some(cached.blob.clone());
        }
        match self.encode() {
            Ok(blob) => {
                let blob: Arc<[u8]> = blob.into();
                self.persisted.store(Some(Arc::new(Persisted {
                    generation,
                    blob: blob.clone(),
                })));
                Some(blob)
            }
            Err(e) => {
                warn_ratelimited!(error = %e, "failed to encode tracing context");
                self.persisted.load_full().map(|p| p.blob.clone())
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let threads = self.threads.snapshot();
        let finish = self.relative(self.clock.ticks());
        let mut encoder =
            IntervalEncoder::new(self.base_nanos, self.clock.tick_multiplier(), threads.len());
        let mut truncated = self.truncated.load(Ordering::Acquire);
        'threads: for (thread_id, sequence) in threads {
            let pruned = {
                let sequence = sequence.lock();
                self.pruner.prune(sequence.iter(), finish)
            };
            let mut thread = encoder.start_thread(thread_id)?;
            for (from, till) in pruned.pairs() {
                if till <= from {
                    continue;
                }
                if thread.encoded_len_with(from, till) > self.max_data_size {
                    truncated = true;
                    break 'threads;
                }
                thread.record_interval(from, till);
            }
            thread.finish();
        }
        if truncated && !self.truncated.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                limit = self.max_data_size,
                "context blob truncated at the size limit"
            );
        }
        encoder.finish(truncated)
    }

    /// Return all storage to the pool. Only the first call returns `true`.
    ///
    /// The blob of the last [`persist`](Self::persist) survives.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        {
            let _persisting = self.persist_lock.lock();
            for sequence in self.threads.drain() {
                sequence.lock().release();
            }
        }
        if let Some(expirable) = self.expirable.get() {
            expirable.expire();
        }
        if let Some(in_flight) = &self.in_flight {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::trace!("released tracing context");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Tick at which the tracker was created.
    pub fn start_ticks(&self) -> i64 {
        self.start_ticks
    }

    pub fn expirable(&self) -> Option<&Expirable> {
        self.expirable.get()
    }
}

impl ContextTracking for ContextTracker {
    fn activate(&self) {
        self.activate_context(current_thread_id(), self.clock.ticks());
    }

    fn deactivate(&self) {
        self.deactivate_context(current_thread_id(), self.clock.ticks(), false);
    }

    fn maybe_deactivate(&self) {
        self.deactivate_context(current_thread_id(), self.clock.ticks(), true);
    }

    fn persist(&self) -> Option<Arc<[u8]>> {
        ContextTracker::persist(self)
    }

    fn release(&self) -> bool {
        ContextTracker::release(self)
    }
}

impl Drop for ContextTracker {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the allocator, expiration ring and clock shared by its trackers.
pub struct TrackerFactory {
    config: TrackerConfig,
    allocator: Arc<dyn Allocator>,
    expiration: Arc<ExpirationTracker>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TrackerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerFactory")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl TrackerFactory {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let allocator = config.build_allocator()?;
        let expiration = Arc::new(ExpirationTracker::new(
            config.inactivity_timeout,
            config.expiration_granularity,
            config.expiration_capacity,
            clock.clone(),
        ));
        tracing::debug!(?config, "created context tracker factory");
        Ok(Self {
            config,
            allocator,
            expiration,
            clock,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn create(&self) -> Option<Arc<ContextTracker>> {
        self.create_tracker(None)
    }

    /// Like [`create`](Self::create), with a delayed activation on `thread_id`.
    pub fn create_with_initial_activation(&self, thread_id: u64) -> Option<Arc<ContextTracker>> {
        self.create_tracker(Some(thread_id))
    }

    fn create_tracker(&self, initial_thread: Option<u64>) -> Option<Arc<ContextTracker>> {
        let max = self.config.max_in_flight;
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_err()
        {
            warn_ratelimited!(max_in_flight = max, "too many in-flight context trackers");
            return None;
        }
        let tracker = Arc::new(
            ContextTracker::new(
                self.allocator.clone(),
                self.clock.clone(),
                &self.config,
                initial_thread,
            )
            .with_in_flight(self.in_flight.clone()),
        );
        let weak = Arc::downgrade(&tracker);
        let expirable = self.expiration.track(move || {
            if let Some(tracker) = weak.upgrade() {
                tracing::trace!("releasing inactive tracing context");
                tracker.release();
            }
        });
        if expirable.is_empty() && !self.config.inactivity_timeout.is_zero() {
            warn_ratelimited!("expiration tracker is full, context will not expire on inactivity");
        }
        let _ = tracker.expirable.set(expirable);
        Some(tracker)
    }

    /// Live trackers created by this factory.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Expire inactive trackers on a background thread until the guard drops.
    pub fn start_cleanup(&self) -> Result<CleanupGuard> {
        Ok(self.expiration.start_cleanup()?)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn expiration(&self) -> &Arc<ExpirationTracker> {
        &self.expiration
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Drop for TrackerFactory {
    fn drop(&mut self) {
        self.expiration.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::clock::ManualClock;
    use crate::context::parser::parse;
    use std::time::Duration;

    fn factory(config: TrackerConfig) -> (TrackerFactory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let factory = TrackerFactory::with_clock(
            config.with_memory_limit(64 * 1024).with_chunk_size(64),
            clock.clone(),
        )
        .unwrap();
        (factory, clock)
    }

    fn triples(tracker: &ContextTracker) -> Vec<(u64, i64, i64)> {
        parse(&tracker.persist().unwrap()).unwrap().triples().collect()
    }

    #[test]
    fn test_records_intervals_per_thread() {
        let (factory, _) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 100);
        tracker.activate_context(2, 150);
        tracker.deactivate_context(1, 200, false);
        tracker.deactivate_context(2, 250, true);
        assert_eq!(triples(&tracker), vec![(1, 100, 200), (2, 150, 250)]);
        assert_eq!(tracker.thread_count(), 2);
    }

    #[test]
    fn test_open_window_closes_at_persist_time() {
        let (factory, clock) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 100);
        clock.set(400);
        assert_eq!(triples(&tracker), vec![(1, 100, 400)]);
    }

    #[test]
    fn test_delayed_initial_activation() {
        let (factory, clock) = factory(TrackerConfig::default());
        clock.set(50);
        let tracker = factory.create_with_initial_activation(7).unwrap();
        assert_eq!(tracker.thread_count(), 0);
        tracker.deactivate_context(7, 80, false);
        assert_eq!(tracker.thread_count(), 1);
        assert_eq!(triples(&tracker), vec![(7, 0, 30)]);
    }

    #[test]
    fn test_persist_is_cached_until_new_events() {
        let (factory, clock) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 10);
        let first = tracker.persist().unwrap();
        clock.set(1000);
        let second = tracker.persist().unwrap();
        assert_eq!(first, second);
        tracker.deactivate_context(1, 20, false);
        let third = tracker.persist().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_release_keeps_last_blob() {
        let (factory, _) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 10);
        tracker.deactivate_context(1, 20, false);
        let blob = tracker.persist().unwrap();
        assert!(tracker.release());
        assert!(!tracker.release());
        assert_eq!(tracker.persist().unwrap(), blob);
        assert_eq!(factory.allocator().free_chunks(), factory.allocator().total_chunks());
    }

    #[test]
    fn test_release_before_persist_yields_nothing() {
        let (factory, _) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 10);
        assert!(tracker.release());
        assert!(tracker.persist().is_none());
        tracker.activate_context(1, 20);
        assert_eq!(tracker.thread_count(), 0);
    }

    #[test]
    fn test_thread_limit_truncates() {
        let (factory, _) = factory(TrackerConfig::default().with_max_threads(1));
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 10);
        tracker.activate_context(2, 10);
        assert!(tracker.is_truncated());
        assert_eq!(tracker.thread_count(), 1);
    }

    #[test]
    fn test_truncation_after_persist_reaches_next_blob() {
        let (factory, _) = factory(TrackerConfig::default().with_max_threads(1));
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 10);
        tracker.deactivate_context(1, 20, false);
        let first = tracker.persist().unwrap();
        assert!(!parse(&first).unwrap().truncated);
        tracker.activate_context(2, 30);
        assert!(tracker.is_truncated());
        let second = tracker.persist().unwrap();
        let decoded = parse(&second).unwrap();
        assert!(decoded.truncated);
        assert_eq!(decoded.triples().collect::<Vec<_>>(), vec![(1, 10, 20)]);
        // the flag is sticky, later drops keep the cached blob
        tracker.activate_context(3, 40);
        assert_eq!(tracker.persist().unwrap(), second);
    }

    #[test]
    fn test_blob_stays_within_budget() {
        let (factory, _) = factory(TrackerConfig::default().with_max_data_size(64));
        let tracker = factory.create().unwrap();
        for i in 0..200i64 {
            tracker.activate_context(1, i * 1000);
            tracker.deactivate_context(1, i * 1000 + 500, false);
        }
        let blob = tracker.persist().unwrap();
        assert!(blob.len() <= 64);
        assert!(tracker.is_truncated());
        let decoded = parse(&blob).unwrap();
        assert!(decoded.truncated);
        assert!(decoded.interval_count() > 0);
    }

    #[test]
    fn test_max_in_flight() {
        let (factory, _) = factory(TrackerConfig::default().with_max_in_flight(1));
        let first = factory.create().unwrap();
        assert!(factory.create().is_none());
        assert_eq!(factory.in_flight(), 1);
        first.release();
        assert_eq!(factory.in_flight(), 0);
        assert!(factory.create().is_some());
    }

    #[test]
    fn test_dropping_tracker_decrements_in_flight() {
        let (factory, _) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        assert_eq!(factory.in_flight(), 1);
        drop(tracker);
        assert_eq!(factory.in_flight(), 0);
    }

    #[test]
    fn test_inactive_tracker_is_released_by_expiration() {
        let config = TrackerConfig::default()
            .with_inactivity_timeout(Duration::from_millis(100))
            .with_expiration_granularity(Duration::from_millis(10));
        let (factory, clock) = factory(config);
        let tracker = factory.create().unwrap();
        tracker.activate_context(1, 0);
        clock.set(200_000_000);
        factory.expiration().process_cleanup();
        assert!(tracker.is_released());
        assert_eq!(factory.in_flight(), 0);
    }

    #[test]
    fn test_activity_postpones_expiration() {
        let config = TrackerConfig::default()
            .with_inactivity_timeout(Duration::from_millis(100))
            .with_expiration_granularity(Duration::from_millis(10));
        let (factory, clock) = factory(config);
        let tracker = factory.create().unwrap();
        clock.set(90_000_000);
        tracker.activate_context(1, 90_000_000);
        clock.set(150_000_000);
        factory.expiration().process_cleanup();
        assert!(!tracker.is_released());
        clock.set(300_000_000);
        factory.expiration().process_cleanup();
        assert!(tracker.is_released());
    }

    #[test]
    fn test_current_thread_entry_points() {
        let (factory, clock) = factory(TrackerConfig::default());
        let tracker = factory.create().unwrap();
        clock.set(10);
        tracker.activate();
        clock.set(20);
        tracker.maybe_deactivate();
        clock.set(30);
        tracker.activate();
        clock.set(40);
        tracker.deactivate();
        let id = current_thread_id();
        assert_eq!(triples(&tracker), vec![(id, 10, 40)]);
    }
}
