//! Tick sources and thread identity.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A monotonic tick counter with a known frequency.
pub trait Clock: Send + Sync {
    fn ticks(&self) -> i64;

    /// Ticks per second.
    fn frequency(&self) -> u64;

    /// Monotonic nanoseconds, used for inactivity bookkeeping.
    fn nanos(&self) -> u64;

    /// Ticks per 1000 ns as written into persisted blobs, never zero.
    fn tick_multiplier(&self) -> u64 {
        (self.frequency() / 1_000_000).max(1)
    }
}

/// `CLOCK_MONOTONIC` with one tick per nanosecond.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn ticks(&self) -> i64 {
        clock_monotonic_ns() as i64
    }

    fn frequency(&self) -> u64 {
        NANOS_PER_SEC
    }

    fn nanos(&self) -> u64 {
        clock_monotonic_ns()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicI64,
    frequency: u64,
}

impl ManualClock {
    pub fn new(frequency: u64) -> Self {
        Self {
            ticks: AtomicI64::new(0),
            frequency: frequency.max(1),
        }
    }

    pub fn set(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::Release);
    }

    pub fn advance(&self, ticks: i64) -> i64 {
        self.ticks.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(NANOS_PER_SEC)
    }
}

impl Clock for ManualClock {
    fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn nanos(&self) -> u64 {
        let ticks = self.ticks().max(0) as u128;
        (ticks * NANOS_PER_SEC as u128 / self.frequency as u128) as u64
    }
}

/// Read `CLOCK_MONOTONIC` in nanoseconds.
pub fn clock_monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Wall-clock nanoseconds since the unix epoch.
pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// OS thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Process-unique id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_does_not_go_back() {
        let clock = MonotonicClock;
        let a = clock.ticks();
        let b = clock.ticks();
        assert!(b >= a);
        assert_eq!(clock.tick_multiplier(), 1000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(2_000_000_000);
        clock.set(10);
        assert_eq!(clock.advance(5), 15);
        assert_eq!(clock.ticks(), 15);
        assert_eq!(clock.nanos(), 7);
        assert_eq!(clock.tick_multiplier(), 2000);
    }

    #[test]
    fn test_low_frequency_multiplier_is_clamped() {
        assert_eq!(ManualClock::new(1000).tick_multiplier(), 1);
    }

    #[test]
    fn test_thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, current_thread_id());
    }

    #[test]
    fn test_epoch_nanos_is_recent() {
        // 2020-01-01 in nanoseconds
        assert!(epoch_nanos() > 1_577_836_800_000_000_000);
    }
}
