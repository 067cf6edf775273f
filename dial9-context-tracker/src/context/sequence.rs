//! Append-only sequence of 64-bit values over allocator chunks.

use crate::context::alloc::{AllocatedBuffer, Allocator};
use std::sync::Arc;

const SLOT_BYTES: usize = 8;

/// Outcome of appending to a [`LongSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Stored at the given position.
    Added(usize),
    /// The sequence's own storage limit was reached.
    LimitReached,
    /// The allocator could not provide another chunk.
    Exhausted,
    /// The sequence was already released.
    Released,
}

impl AddResult {
    pub fn position(self) -> Option<usize> {
        match self {
            AddResult::Added(pos) => Some(pos),
            _ => None,
        }
    }

    pub fn is_added(self) -> bool {
        matches!(self, AddResult::Added(_))
    }
}

/// Ordered, append-only list of `i64` values.
///
/// Storage is obtained lazily from the allocator, one chunk at a time. A failed
/// append leaves the sequence untouched.
pub struct LongSequence {
    allocator: Arc<dyn Allocator>,
    buffer: Option<AllocatedBuffer>,
    size: usize,
    /// Maximum number of values accepted by appends that obey the limit.
    limit: usize,
    released: bool,
}

impl std::fmt::Debug for LongSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongSequence")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("released", &self.released)
            .finish()
    }
}

impl LongSequence {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            buffer: None,
            size: 0,
            limit: usize::MAX,
            released: false,
        }
    }

    /// A sequence that rejects limit-obeying appends once `max_bytes` worth of
    /// values are stored.
    pub fn with_limit(allocator: Arc<dyn Allocator>, max_bytes: usize) -> Self {
        let mut sequence = Self::new(allocator);
        sequence.limit = max_bytes / SLOT_BYTES;
        sequence
    }

    pub fn add(&mut self, value: i64) -> AddResult {
        self.push(value, true)
    }

    /// Append `value`. With `obey_limit == false` the storage limit is ignored,
    /// allocator exhaustion still applies.
    pub fn push(&mut self, value: i64, obey_limit: bool) -> AddResult {
        if self.released {
            return AddResult::Released;
        }
        if obey_limit && self.size >= self.limit {
            return AddResult::LimitReached;
        }
        if !self.ensure_slot() {
            return AddResult::Exhausted;
        }
        let pos = self.size;
        let stored = self
            .buffer
            .as_ref()
            .is_some_and(|buf| buf.put_long(pos * SLOT_BYTES, value));
        if !stored {
            return AddResult::Exhausted;
        }
        self.size += 1;
        AddResult::Added(pos)
    }

    fn ensure_slot(&mut self) -> bool {
        match self.buffer {
            None => match self.allocator.allocate_chunks(1) {
                Some(buf) => {
                    self.buffer = Some(buf);
                    true
                }
                None => false,
            },
            Some(ref mut buf) if self.size >= buf.capacity_longs() => buf.grow(1),
            Some(_) => true,
        }
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.size {
            return None;
        }
        self.buffer.as_ref()?.get_long(index * SLOT_BYTES)
    }

    /// Overwrite an already stored value. Out-of-range indices are rejected.
    pub fn set(&mut self, index: usize, value: i64) -> bool {
        if index >= self.size {
            return false;
        }
        self.buffer
            .as_ref()
            .is_some_and(|buf| buf.put_long(index * SLOT_BYTES, value))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size * SLOT_BYTES
    }

    /// Bytes currently backed by chunks.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.capacity())
    }

    pub fn iter(&self) -> SequenceIter<'_> {
        SequenceIter {
            sequence: self,
            index: 0,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the backing chunks. Returns `false` when already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.size = 0;
        if let Some(mut buf) = self.buffer.take() {
            self.allocator.release(&mut buf);
        }
        true
    }
}

impl Drop for LongSequence {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'a> IntoIterator for &'a LongSequence {
    type Item = i64;
    type IntoIter = SequenceIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Forward-only cursor over the committed values of a sequence.
pub struct SequenceIter<'a> {
    sequence: &'a LongSequence,
    index: usize,
}

impl Iterator for SequenceIter<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let value = self.sequence.get(self.index)?;
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.sequence.size.saturating_sub(self.index);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SequenceIter<'_> {}
