//! Span context tracking: per-thread activity logs encoded into compact blobs.
//!
//! The pieces, bottom up:
//! - [`alloc`]: fixed-capacity chunk pools (heap or mmap backed)
//! - [`sequence`]: append-only `i64` logs on top of those chunks
//! - [`pruner`]: turns a thread's transition log into intervals
//! - [`leb128`], [`encoder`], [`parser`]: the persisted blob format
//! - [`expiration`]: releases trackers after a period of inactivity
//! - [`tracker`]: the per-span tracker and its factory

pub mod alloc;
pub mod clock;
pub mod config;
pub mod encoder;
pub mod error;
pub mod expiration;
pub mod leb128;
pub mod parser;
pub mod pruner;
pub mod sequence;
pub mod tracker;

pub use alloc::{AllocatedBuffer, Allocator, HeapAllocator};
#[cfg(unix)]
pub use alloc::DirectAllocator;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AllocatorKind, TrackerConfig};
pub use encoder::{IntervalEncoder, ThreadEncoder};
pub use error::{Error, Result};
pub use expiration::{CleanupGuard, Expirable, ExpirationTracker};
pub use parser::{DecodedContext, Interval, ThreadIntervals, parse};
pub use pruner::{IntervalSequencePruner, MaskedTick, PrunedIntervals, Transition};
pub use sequence::{AddResult, LongSequence};
pub use tracker::{ContextTracker, ContextTracking, TrackerFactory};
