//! Size-bounded inactivity expiration.
//!
//! Time is cut into slots of `granularity`. A ring of
//! `ceil(expiration / granularity) + 1` buckets holds the tracked entries;
//! slot `s` lives in bucket `s % N`. A bucket for slot `s` becomes due once
//! `(s + 1) * granularity + expiration` has passed, which is always the case
//! before slot `s + N` needs the same bucket again.
//!
//! Cleanup drains due buckets. Entries that were touched since they were
//! tracked are moved to the bucket of their last access instead of being
//! expired; everything else gets its callback run exactly once.
//!
//! Buckets are bounded lock-free queues. Tracking never blocks and never
//! grows memory: a full bucket yields [`Expirable::EMPTY`].

use crate::context::clock::Clock;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const VACANT: u64 = u64::MAX;

type Callback = Box<dyn FnOnce() + Send>;

struct ExpirableState {
    last_access: AtomicU64,
    expiration_ns: u64,
    callback: Mutex<Option<Callback>>,
    clock: Arc<dyn Clock>,
}

impl ExpirableState {
    fn is_expired(&self) -> bool {
        self.callback.lock().is_none()
    }

    fn is_expiring(&self, now_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_access.load(Ordering::Acquire)) >= self.expiration_ns
            && !self.is_expired()
    }

    fn expire(&self) -> bool {
        let Some(callback) = self.callback.lock().take() else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::debug!("expiration callback panicked");
        }
        true
    }
}

/// Handle to a tracked entry.
///
/// The empty handle is returned when nothing could be tracked; all of its
/// operations are no-ops.
#[derive(Clone)]
pub struct Expirable(Option<Arc<ExpirableState>>);

impl std::fmt::Debug for Expirable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            None => f.write_str("Expirable::EMPTY"),
            Some(state) => f
                .debug_struct("Expirable")
                .field("last_access", &state.last_access.load(Ordering::Relaxed))
                .field("expired", &state.is_expired())
                .finish(),
        }
    }
}

impl Expirable {
    pub const EMPTY: Expirable = Expirable(None);

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The callback already ran, or was taken by an explicit [`expire`](Self::expire).
    pub fn is_expired(&self) -> bool {
        self.0.as_ref().is_some_and(|s| s.is_expired())
    }

    /// Whether the inactivity window has elapsed at `now_ns` without the
    /// entry being expired yet.
    pub fn is_expiring(&self, now_ns: u64) -> bool {
        self.0.as_ref().is_some_and(|s| s.is_expiring(now_ns))
    }

    /// Run the callback now. Returns `false` if it already ran.
    ///
    /// Safe to race with cleanup; exactly one caller runs the callback.
    pub fn expire(&self) -> bool {
        self.0.as_ref().is_some_and(|s| s.expire())
    }

    /// Restart the inactivity window from the current clock reading.
    pub fn touch(&self) {
        if let Some(state) = &self.0 {
            self.touch_at(state.clock.nanos());
        }
    }

    pub fn touch_at(&self, now_ns: u64) {
        if let Some(state) = &self.0 {
            state.last_access.fetch_max(now_ns, Ordering::AcqRel);
        }
    }

    pub fn last_access(&self) -> Option<u64> {
        self.0
            .as_ref()
            .map(|s| s.last_access.load(Ordering::Acquire))
    }
}

struct Bucket {
    /// Slot this bucket currently serves, or `VACANT`.
    epoch: AtomicU64,
    entries: ArrayQueue<Arc<ExpirableState>>,
    cleaning: Mutex<()>,
}

pub struct ExpirationTracker {
    buckets: Box<[Bucket]>,
    granularity_ns: u64,
    expiration_ns: u64,
    bucket_capacity: usize,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ExpirationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationTracker")
            .field("buckets", &self.buckets.len())
            .field("bucket_capacity", &self.bucket_capacity)
            .field("granularity_ns", &self.granularity_ns)
            .field("expiration_ns", &self.expiration_ns)
            .finish()
    }
}

impl ExpirationTracker {
    /// A zero `expiration` creates a tracker that never tracks anything.
    /// `granularity` is clamped to at least one nanosecond.
    pub fn new(
        expiration: Duration,
        granularity: Duration,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let granularity_ns = (granularity.as_nanos() as u64).max(1);
        let expiration_ns = expiration.as_nanos() as u64;
        let num_buckets = expiration_ns.div_ceil(granularity_ns) as usize + 1;
        let bucket_capacity = capacity.div_ceil(num_buckets).max(1);
        tracing::debug!(
            capacity,
            num_buckets,
            bucket_capacity,
            "created expiration tracker"
        );
        let buckets = (0..num_buckets)
            .map(|_| Bucket {
                epoch: AtomicU64::new(VACANT),
                entries: ArrayQueue::new(bucket_capacity),
                cleaning: Mutex::new(()),
            })
            .collect();
        Self {
            buckets,
            granularity_ns,
            expiration_ns,
            bucket_capacity,
            closed: AtomicBool::new(false),
            clock,
        }
    }

    /// Total number of entries the ring can hold.
    pub fn capacity(&self) -> usize {
        self.buckets.len() * self.bucket_capacity
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_nanos(self.granularity_ns)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting new entries. Already tracked entries still expire.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn track(&self, on_expired: impl FnOnce() + Send + 'static) -> Expirable {
        self.track_at(self.clock.nanos(), on_expired)
    }

    pub fn track_at(&self, now_ns: u64, on_expired: impl FnOnce() + Send + 'static) -> Expirable {
        if self.expiration_ns == 0 || self.is_closed() {
            return Expirable::EMPTY;
        }
        let slot = now_ns / self.granularity_ns;
        let bucket = self.bucket_for(slot);
        let epoch = bucket.epoch.load(Ordering::Acquire);
        if epoch == VACANT || epoch < slot {
            self.recycle(bucket, slot, now_ns);
        }
        let state = Arc::new(ExpirableState {
            last_access: AtomicU64::new(now_ns),
            expiration_ns: self.expiration_ns,
            callback: Mutex::new(Some(Box::new(on_expired))),
            clock: self.clock.clone(),
        });
        match bucket.entries.push(state.clone()) {
            Ok(()) => Expirable(Some(state)),
            Err(_) => {
                tracing::trace!(slot, "expiration bucket full");
                Expirable::EMPTY
            }
        }
    }

    fn bucket_for(&self, slot: u64) -> &Bucket {
        &self.buckets[(slot % self.buckets.len() as u64) as usize]
    }

    /// Point a vacant or stale bucket at `slot`, draining what it still holds.
    /// Returns the number of callbacks run.
    fn recycle(&self, bucket: &Bucket, slot: u64, now_ns: u64) -> usize {
        let (expiring, survivors) = {
            let _cleaning = bucket.cleaning.lock();
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch != VACANT && epoch >= slot {
                return 0;
            }
            let drained = self.drain(bucket, now_ns);
            bucket.epoch.store(slot, Ordering::Release);
            drained
        };
        run_callbacks(expiring) + self.rehome(bucket, survivors, now_ns)
    }

    /// Empty `bucket`, splitting its live entries into due and not yet due.
    fn drain(
        &self,
        bucket: &Bucket,
        now_ns: u64,
    ) -> (Vec<Arc<ExpirableState>>, Vec<Arc<ExpirableState>>) {
        let mut expiring = Vec::new();
        let mut survivors = Vec::new();
        for _ in 0..bucket.entries.len() {
            let Some(entry) = bucket.entries.pop() else {
                break;
            };
            if entry.is_expired() {
                continue;
            }
            if entry.is_expiring(now_ns) {
                expiring.push(entry);
            } else {
                survivors.push(entry);
            }
        }
        (expiring, survivors)
    }

    /// Move touched entries to the bucket of their last access, falling back
    /// to the current slot and then to `source`, the bucket they were drained
    /// from. Entries only expire here when all of these are full.
    ///
    /// Must be called without holding any bucket lock. Returns the number of
    /// callbacks run.
    fn rehome(
        &self,
        source: &Bucket,
        survivors: Vec<Arc<ExpirableState>>,
        now_ns: u64,
    ) -> usize {
        let now_slot = now_ns / self.granularity_ns;
        let mut expired = 0;
        let mut homeless = Vec::new();
        for entry in survivors {
            let access_slot = entry.last_access.load(Ordering::Acquire) / self.granularity_ns;
            let placed = self.push_live(access_slot, &entry, now_ns, &mut expired)
                || (access_slot != now_slot
                    && self.push_live(now_slot, &entry, now_ns, &mut expired))
                || source.entries.push(entry.clone()).is_ok();
            if !placed {
                tracing::debug!(access_slot, "no room to keep a live entry, expiring it early");
                homeless.push(entry);
            }
        }
        expired + run_callbacks(homeless)
    }

    /// Push into the bucket of `slot`, claiming it when vacant and recycling it
    /// first when it still serves an older slot.
    fn push_live(
        &self,
        slot: u64,
        entry: &Arc<ExpirableState>,
        now_ns: u64,
        expired: &mut usize,
    ) -> bool {
        let bucket = self.bucket_for(slot);
        let epoch = bucket.epoch.load(Ordering::Acquire);
        if epoch != VACANT && epoch < slot {
            *expired += self.recycle(bucket, slot, now_ns);
        }
        let serves = match bucket.epoch.compare_exchange(
            VACANT,
            slot,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(epoch) => epoch == slot,
        };
        serves && bucket.entries.push(entry.clone()).is_ok()
    }

    fn is_due(&self, epoch: u64, now_ns: u64) -> bool {
        epoch
            .saturating_add(1)
            .saturating_mul(self.granularity_ns)
            .saturating_add(self.expiration_ns)
            <= now_ns
    }

    pub fn process_cleanup(&self) -> usize {
        self.process_cleanup_at(self.clock.nanos())
    }

    /// Drain every due bucket. Returns the number of callbacks run.
    pub fn process_cleanup_at(&self, now_ns: u64) -> usize {
        let mut expired = 0;
        for bucket in self.buckets.iter() {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            // Vacant buckets can only hold entries pushed while they were drained.
            let due = if epoch == VACANT {
                !bucket.entries.is_empty()
            } else {
                self.is_due(epoch, now_ns)
            };
            if !due {
                continue;
            }
            let (expiring, survivors) = {
                let _cleaning = bucket.cleaning.lock();
                let epoch = bucket.epoch.load(Ordering::Acquire);
                if epoch != VACANT && !self.is_due(epoch, now_ns) {
                    continue;
                }
                let drained = self.drain(bucket, now_ns);
                bucket.epoch.store(VACANT, Ordering::Release);
                drained
            };
            expired += run_callbacks(expiring);
            expired += self.rehome(bucket, survivors, now_ns);
        }
        if expired > 0 {
            tracing::trace!(expired, "expiration cleanup");
        }
        expired
    }

    /// Run [`process_cleanup`](Self::process_cleanup) every half granularity
    /// on a dedicated thread until the returned guard is dropped.
    pub fn start_cleanup(self: &Arc<Self>) -> std::io::Result<CleanupGuard> {
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_nanos((self.granularity_ns / 2).max(1));
        let tick = period.min(Duration::from_millis(5));
        let thread = {
            let tracker = self.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("context-expiration".into())
                .spawn(move || {
                    let mut since_cleanup = Duration::ZERO;
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(tick);
                        since_cleanup += tick;
                        if since_cleanup >= period {
                            since_cleanup = Duration::ZERO;
                            tracker.process_cleanup();
                        }
                    }
                })?
        };
        Ok(CleanupGuard {
            stop,
            thread: Some(thread),
        })
    }
}

/// Runs the callbacks of `entries` outside of any bucket lock.
fn run_callbacks(entries: Vec<Arc<ExpirableState>>) -> usize {
    entries.iter().filter(|e| e.expire()).count()
}

/// Stops and joins the background cleanup thread when dropped.
#[derive(Debug)]
pub struct CleanupGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
