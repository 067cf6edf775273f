//! Per-thread transition logs of one tracker.

use crate::context::sequence::LongSequence;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type SharedSequence = Arc<Mutex<LongSequence>>;

pub(crate) enum Slot {
    Existing(SharedSequence),
    Created(SharedSequence),
    /// The thread is new and the map already holds `max_threads` threads.
    Full,
    /// The map was drained and takes no new threads.
    Closed,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<u64, SharedSequence>,
    /// Thread ids in first-seen order.
    order: Vec<u64>,
    closed: bool,
}

/// Thread id to sequence map. Lookups of known threads only take the read
/// lock; the write lock is held just long enough to insert a new thread.
#[derive(Default)]
pub(crate) struct ThreadMap {
    inner: RwLock<Inner>,
}

impl ThreadMap {
    pub(crate) fn get_or_insert(
        &self,
        thread_id: u64,
        max_threads: usize,
        make: impl FnOnce() -> LongSequence,
    ) -> Slot {
        if let Some(seq) = self.inner.read().by_id.get(&thread_id) {
            return Slot::Existing(seq.clone());
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return Slot::Closed;
        }
        if let Some(seq) = inner.by_id.get(&thread_id) {
            return Slot::Existing(seq.clone());
        }
        if inner.order.len() >= max_threads {
            return Slot::Full;
        }
        let seq = Arc::new(Mutex::new(make()));
        inner.by_id.insert(thread_id, seq.clone());
        inner.order.push(thread_id);
        Slot::Created(seq)
    }

    /// All threads in first-seen order.
    pub(crate) fn snapshot(&self) -> Vec<(u64, SharedSequence)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).map(|seq| (*id, seq.clone())))
            .collect()
    }

    /// Remove every thread, handing the sequences to the caller. The map
    /// stays closed afterwards.
    pub(crate) fn drain(&self) -> Vec<SharedSequence> {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.order.clear();
        inner.by_id.drain().map(|(_, seq)| seq).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().order.len()
    }
}
