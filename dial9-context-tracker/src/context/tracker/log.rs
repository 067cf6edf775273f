//! Rate-limited logging for hot paths.

use crate::context::clock::clock_monotonic_ns;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NEVER: u64 = u64::MAX;

/// Lets through at most one event per interval. Meant to live in a `static`
/// next to the call site it throttles.
#[derive(Debug)]
pub struct RateLimitedWarn {
    interval_ns: u64,
    last_ns: AtomicU64,
}

impl RateLimitedWarn {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval_ns: interval.as_nanos() as u64,
            last_ns: AtomicU64::new(NEVER),
        }
    }

    pub fn should_log(&self) -> bool {
        self.should_log_at(clock_monotonic_ns())
    }

    pub fn should_log_at(&self, now_ns: u64) -> bool {
        let last = self.last_ns.load(Ordering::Relaxed);
        if last != NEVER && now_ns.saturating_sub(last) < self.interval_ns {
            return false;
        }
        self.last_ns
            .compare_exchange(last, now_ns, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// `tracing::warn!` throttled to once per 30 seconds per call site.
macro_rules! warn_ratelimited {
    ($($arg:tt)+) => {{
        static LIMIT: $crate::context::tracker::log::RateLimitedWarn =
            $crate::context::tracker::log::RateLimitedWarn::new(::std::time::Duration::from_secs(30));
        if LIMIT.should_log() {
            ::tracing::warn!($($arg)+);
        }
    }};
}

pub(crate) use warn_ratelimited;
