//! Fixed-capacity chunk allocator.
//!
//! A pool is one preallocated region split into equal-size chunks. Chunks are
//! identified by their index and handed out through a lock-free free-list, so
//! allocation never touches the global allocator once the pool exists.
//!
//! Two backing strategies share the exact same behaviour:
//!
//! - [`HeapAllocator`] keeps the region in a boxed slice.
//! - [`DirectAllocator`] maps an anonymous region with `mmap`, outside of the
//!   Rust heap (unix only).
//!
//! Storage is addressed as 64-bit atomic words. Writers and readers of one
//! buffer are serialized by its owner; the atomics only guarantee that a single
//! 64-bit value is never torn.

use crate::context::error::{Error, Result};
use crossbeam_queue::ArrayQueue;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WORD_BYTES: usize = 8;

/// Source of chunked buffers.
///
/// Exhaustion is a normal outcome: both allocation methods return `None`
/// instead of growing past the configured capacity.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate enough whole chunks to hold at least `min_bytes`.
    fn allocate(&self, min_bytes: usize) -> Option<AllocatedBuffer>;

    /// Allocate exactly `chunks` chunks.
    fn allocate_chunks(&self, chunks: usize) -> Option<AllocatedBuffer>;

    /// Return the buffer's chunks to this allocator. Releasing twice is a no-op.
    fn release(&self, buffer: &mut AllocatedBuffer);

    fn chunk_size(&self) -> usize;

    fn total_chunks(&self) -> usize;

    fn free_chunks(&self) -> usize;
}

trait Backing: Send + Sync {
    fn words(&self) -> &[AtomicU64];
}

struct HeapBacking {
    words: Box<[AtomicU64]>,
}

impl Backing for HeapBacking {
    fn words(&self) -> &[AtomicU64] {
        &self.words
    }
}

#[cfg(unix)]
struct DirectBacking {
    base: std::ptr::NonNull<AtomicU64>,
    len_words: usize,
    mapped_bytes: usize,
}

// Safety: the mapping is owned exclusively by this struct and only exposed as
// a slice of atomics, which are themselves Sync.
#[cfg(unix)]
unsafe impl Send for DirectBacking {}
#[cfg(unix)]
unsafe impl Sync for DirectBacking {}

#[cfg(unix)]
impl DirectBacking {
    fn map(bytes: usize) -> std::io::Result<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        // Anonymous mappings are page aligned and zero filled, which is a valid
        // bit pattern for AtomicU64.
        let base = std::ptr::NonNull::new(base as *mut AtomicU64)
            .ok_or_else(|| std::io::Error::other("mmap returned a null mapping"))?;
        Ok(Self {
            base,
            len_words: bytes / WORD_BYTES,
            mapped_bytes: bytes,
        })
    }
}

#[cfg(unix)]
impl Backing for DirectBacking {
    fn words(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len_words) }
    }
}

#[cfg(unix)]
impl Drop for DirectBacking {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped_bytes);
        }
    }
}

/// Shared state of one pool: the backing region plus its free-list.
struct ChunkPool {
    backing: Box<dyn Backing>,
    chunk_words: usize,
    total_chunks: usize,
    free: ArrayQueue<u32>,
    /// Chunks that may still be reserved. Always <= `free.len()`: releases push
    /// before incrementing, allocations decrement before popping.
    available: AtomicUsize,
}

impl ChunkPool {
    fn new(backing: Box<dyn Backing>, chunk_size: usize, total_chunks: usize) -> Self {
        let free = ArrayQueue::new(total_chunks);
        for idx in 0..total_chunks {
            let _ = free.push(idx as u32);
        }
        Self {
            backing,
            chunk_words: chunk_size / WORD_BYTES,
            total_chunks,
            free,
            available: AtomicUsize::new(total_chunks),
        }
    }

    fn take(&self, count: usize) -> Option<SmallVec<[u32; 4]>> {
        if count == 0 {
            return None;
        }
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                avail.checked_sub(count)
            })
            .ok()?;
        let mut chunks = SmallVec::with_capacity(count);
        for _ in 0..count {
            match self.free.pop() {
                Some(idx) => {
                    self.zero(idx);
                    chunks.push(idx);
                }
                None => {
                    debug_assert!(false, "free-list shorter than the reserved count");
                    for &idx in &chunks {
                        let _ = self.free.push(idx);
                    }
                    self.available.fetch_add(count, Ordering::AcqRel);
                    return None;
                }
            }
        }
        Some(chunks)
    }

    fn give_back(&self, chunks: &[u32]) {
        for &idx in chunks {
            let _ = self.free.push(idx);
        }
        self.available.fetch_add(chunks.len(), Ordering::AcqRel);
    }

    fn zero(&self, chunk: u32) {
        let start = chunk as usize * self.chunk_words;
        for word in &self.backing.words()[start..start + self.chunk_words] {
            word.store(0, Ordering::Relaxed);
        }
    }

    fn word(&self, chunk: u32, offset_words: usize) -> &AtomicU64 {
        &self.backing.words()[chunk as usize * self.chunk_words + offset_words]
    }

    fn chunks_for(&self, bytes: usize) -> usize {
        let chunk_bytes = self.chunk_words * WORD_BYTES;
        bytes.div_ceil(chunk_bytes).max(1)
    }
}

/// One or more chunks presented as a single addressable range of 64-bit slots.
///
/// The chunks are chained, not contiguous in the backing region, but offsets
/// are contiguous from the caller's point of view. Dropping the buffer returns
/// its chunks to the pool.
pub struct AllocatedBuffer {
    pool: Arc<ChunkPool>,
    chunks: SmallVec<[u32; 4]>,
}

impl fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("chunks", &self.chunks)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl AllocatedBuffer {
    /// Capacity in bytes; zero once released.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.pool.chunk_words * WORD_BYTES
    }

    /// Capacity in 64-bit slots.
    pub fn capacity_longs(&self) -> usize {
        self.chunks.len() * self.pool.chunk_words
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_released(&self) -> bool {
        self.chunks.is_empty()
    }

    fn slot(&self, offset: usize) -> Option<&AtomicU64> {
        if offset % WORD_BYTES != 0 {
            return None;
        }
        let index = offset / WORD_BYTES;
        let chunk = *self.chunks.get(index / self.pool.chunk_words)?;
        Some(self.pool.word(chunk, index % self.pool.chunk_words))
    }

    /// Store `value` at the 8-byte aligned byte `offset`.
    ///
    /// Returns `false` for offsets outside the capacity or not aligned to 8;
    /// nothing is written in that case.
    pub fn put_long(&self, offset: usize, value: i64) -> bool {
        match self.slot(offset) {
            Some(slot) => {
                slot.store(value as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get_long(&self, offset: usize) -> Option<i64> {
        self.slot(offset).map(|slot| slot.load(Ordering::Relaxed) as i64)
    }

    /// Append `chunks` more chunks from the owning pool.
    ///
    /// Either all requested chunks are appended or none is.
    pub fn grow(&mut self, chunks: usize) -> bool {
        if self.is_released() {
            return false;
        }
        match self.pool.take(chunks) {
            Some(more) => {
                self.chunks.extend(more);
                true
            }
            None => false,
        }
    }

    /// Return all chunks to the pool. Returns `false` if already released.
    pub fn release(&mut self) -> bool {
        if self.chunks.is_empty() {
            return false;
        }
        self.pool.give_back(&self.chunks);
        self.chunks.clear();
        true
    }

    /// All stored slots in offset order, including never written (zero) ones.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let words = self.pool.chunk_words;
        self.chunks.iter().flat_map(move |&chunk| {
            (0..words).map(move |w| self.pool.word(chunk, w).load(Ordering::Relaxed) as i64)
        })
    }

    fn belongs_to(&self, pool: &Arc<ChunkPool>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

fn validate_geometry(capacity: usize, chunk_size: usize) -> Result<usize> {
    if chunk_size == 0 || chunk_size % WORD_BYTES != 0 {
        return Err(Error::invalid_config(format!(
            "chunk size must be a positive multiple of {WORD_BYTES}, got {chunk_size}"
        )));
    }
    let total_chunks = capacity / chunk_size;
    if total_chunks == 0 {
        return Err(Error::invalid_config(format!(
            "capacity {capacity} is smaller than one chunk of {chunk_size} bytes"
        )));
    }
    if total_chunks > u32::MAX as usize {
        return Err(Error::invalid_config(format!(
            "too many chunks: {total_chunks}"
        )));
    }
    Ok(total_chunks)
}

macro_rules! chunk_allocator {
    ($name:ident, $label:literal) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($label)
                    .field("chunk_size", &self.chunk_size())
                    .field("total_chunks", &self.pool.total_chunks)
                    .field("free_chunks", &self.free_chunks())
                    .finish()
            }
        }

        impl Allocator for $name {
            fn allocate(&self, min_bytes: usize) -> Option<AllocatedBuffer> {
                self.allocate_chunks(self.pool.chunks_for(min_bytes))
            }

            fn allocate_chunks(&self, chunks: usize) -> Option<AllocatedBuffer> {
                let chunks = self.pool.take(chunks)?;
                Some(AllocatedBuffer {
                    pool: self.pool.clone(),
                    chunks,
                })
            }

            fn release(&self, buffer: &mut AllocatedBuffer) {
                if buffer.belongs_to(&self.pool) {
                    buffer.release();
                } else {
                    tracing::debug!("ignoring release of a buffer owned by another pool");
                }
            }

            fn chunk_size(&self) -> usize {
                self.pool.chunk_words * WORD_BYTES
            }

            fn total_chunks(&self) -> usize {
                self.pool.total_chunks
            }

            fn free_chunks(&self) -> usize {
                self.pool.available.load(Ordering::Acquire)
            }
        }
    };
}

/// Chunk pool backed by a boxed slice on the Rust heap.
pub struct HeapAllocator {
    pool: Arc<ChunkPool>,
}

impl HeapAllocator {
    pub fn new(capacity: usize, chunk_size: usize) -> Result<Self> {
        let total_chunks = validate_geometry(capacity, chunk_size)?;
        let words = (0..total_chunks * chunk_size / WORD_BYTES)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let backing = Box::new(HeapBacking { words });
        Ok(Self {
            pool: Arc::new(ChunkPool::new(backing, chunk_size, total_chunks)),
        })
    }
}

chunk_allocator!(HeapAllocator, "HeapAllocator");

/// Chunk pool backed by an anonymous memory mapping outside of the Rust heap.
#[cfg(unix)]
pub struct DirectAllocator {
    pool: Arc<ChunkPool>,
}

#[cfg(unix)]
impl DirectAllocator {
    pub fn new(capacity: usize, chunk_size: usize) -> Result<Self> {
        let total_chunks = validate_geometry(capacity, chunk_size)?;
        let backing = Box::new(DirectBacking::map(total_chunks * chunk_size)?);
        Ok(Self {
            pool: Arc::new(ChunkPool::new(backing, chunk_size, total_chunks)),
        })
    }
}

#[cfg(unix)]
chunk_allocator!(DirectAllocator, "DirectAllocator");
