//! Encoder for the persisted context blob.
//!
//! ## Layout
//! ```text
//! Prologue:
//!   u8      truncated flag (0 or 1)
//!   i32 LE  data chunk offset, from the start of the blob
//!   varint  base timestamp, epoch nanoseconds
//!   varint  tick multiplier, ticks per 1000 ns
//!   varint  thread count
//!   thread count times:
//!     varint  thread id
//!     varint  interval count
//! Data chunk:
//!   i32 LE  size bitmap offset, from the start of the data chunk
//!   group varint values, two per interval: start delta, end delta
//!   size bitmap
//! ```
//!
//! Deltas are per thread. The first start delta is taken against tick 0 (the
//! tracker start), every following value against the previous timestamp, so
//! most deltas fit in one or two bytes.

use crate::context::error::{Error, Result};
use crate::context::leb128::{self, GroupVarintWriter, varint_size};

/// Prologue bytes before the first varint: truncated flag + data offset.
pub const FIXED_PROLOGUE_LEN: usize = 1 + 4;
/// Bitmap offset at the start of the data chunk.
pub const DATA_CHUNK_HEADER_LEN: usize = 4;

#[derive(Debug)]
pub struct IntervalEncoder {
    base_nanos: u64,
    tick_multiplier: u64,
    max_threads: usize,
    started_threads: usize,
    /// `(thread id, interval count)` for every thread that recorded something.
    threads: Vec<(u64, u64)>,
    payload: GroupVarintWriter,
    finished: bool,
}

impl IntervalEncoder {
    pub fn new(base_nanos: u64, tick_multiplier: u64, max_threads: usize) -> Self {
        Self {
            base_nanos,
            tick_multiplier,
            max_threads,
            started_threads: 0,
            threads: Vec::new(),
            payload: GroupVarintWriter::new(),
            finished: false,
        }
    }

    /// Open the interval stream of one thread.
    ///
    /// The returned encoder mutably borrows `self`, so a second thread cannot
    /// be started while one is open, and the blob cannot be finished with a
    /// thread still in flight.
    ///
    /// `max_threads` caps the threads started over the encoder's whole life,
    /// not only those open at once, so callers size it to the number of
    /// threads they are about to encode.
    pub fn start_thread(&mut self, thread_id: u64) -> Result<ThreadEncoder<'_>> {
        if self.finished {
            return Err(Error::illegal_state("encoder already finished"));
        }
        if self.started_threads >= self.max_threads {
            return Err(Error::ThreadLimitReached {
                limit: self.max_threads,
            });
        }
        self.started_threads += 1;
        Ok(ThreadEncoder {
            encoder: self,
            thread_id,
            running: 0,
            intervals: 0,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn prologue_len(&self, threads: impl Iterator<Item = (u64, u64)>, thread_count: usize) -> usize {
        let map: usize = threads
            .map(|(id, count)| varint_size(id) + varint_size(count))
            .sum();
        FIXED_PROLOGUE_LEN
            + varint_size(self.base_nanos)
            + varint_size(self.tick_multiplier)
            + varint_size(thread_count as u64)
            + map
    }

    /// Size of the blob [`finish`](Self::finish) would produce right now.
    pub fn encoded_len(&self) -> usize {
        self.prologue_len(self.threads.iter().copied(), self.threads.len())
            + DATA_CHUNK_HEADER_LEN
            + self.payload.encoded_len()
    }

    /// Assemble the blob. A second call fails with [`Error::IllegalState`].
    pub fn finish(&mut self, truncated: bool) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::illegal_state("encoder already finished"));
        }
        self.finished = true;

        let mut prologue = Vec::with_capacity(self.encoded_len());
        prologue.push(truncated as u8);
        prologue.extend_from_slice(&[0; 4]);
        leb128::put_varint(&mut prologue, self.base_nanos)?;
        leb128::put_varint(&mut prologue, self.tick_multiplier)?;
        leb128::put_varint(&mut prologue, self.threads.len() as u64)?;
        for &(id, count) in &self.threads {
            leb128::put_varint(&mut prologue, id)?;
            leb128::put_varint(&mut prologue, count)?;
        }

        let data_offset = offset_i32(prologue.len())?;
        prologue[1..FIXED_PROLOGUE_LEN].copy_from_slice(&data_offset.to_le_bytes());

        let bitmap_offset = offset_i32(DATA_CHUNK_HEADER_LEN + self.payload.data().len())?;
        let mut blob = prologue;
        blob.extend_from_slice(&bitmap_offset.to_le_bytes());
        blob.extend_from_slice(self.payload.data());
        blob.extend_from_slice(self.payload.bitmap());
        Ok(blob)
    }
}

fn offset_i32(offset: usize) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::illegal_state("blob larger than i32::MAX bytes"))
}

/// Records the intervals of one thread. Intervals must be fed in order.
///
/// The thread is registered in the prologue when this value is finished or
/// dropped; a thread that recorded no interval leaves no trace in the blob.
#[derive(Debug)]
pub struct ThreadEncoder<'a> {
    encoder: &'a mut IntervalEncoder,
    thread_id: u64,
    running: i64,
    intervals: u64,
}

impl ThreadEncoder<'_> {
    fn deltas(&self, from: i64, till: i64) -> [u64; 2] {
        [
            from.wrapping_sub(self.running) as u64,
            till.wrapping_sub(from) as u64,
        ]
    }

    pub fn record_interval(&mut self, from: i64, till: i64) {
        for delta in self.deltas(from, till) {
            self.encoder.payload.put(delta);
        }
        self.running = till;
        self.intervals += 1;
    }

    /// Exact blob size if `(from, till)` were recorded next and everything
    /// was finished afterwards.
    pub fn encoded_len_with(&self, from: i64, till: i64) -> usize {
        let enc = &*self.encoder;
        let this = (self.thread_id, self.intervals + 1);
        let threads = enc.threads.iter().copied().chain(std::iter::once(this));
        enc.prologue_len(threads, enc.threads.len() + 1)
            + DATA_CHUNK_HEADER_LEN
            + enc.payload.encoded_len_with(&self.deltas(from, till))
    }

    pub fn intervals(&self) -> u64 {
        self.intervals
    }

    pub fn finish(self) {}
}

impl Drop for ThreadEncoder<'_> {
    fn drop(&mut self) {
        if self.intervals > 0 {
            self.encoder.threads.push((self.thread_id, self.intervals));
        }
    }
}
