//! Uptime clock
//!
//! A monotonic millisecond counter advanced by the timer interrupt. The
//! scheduler keeps its own copy of the clock for testability; this global
//! is the wall clock the rest of the kernel (filesystem timestamps, the
//! smoke suite) reads.

use core::sync::atomic::{AtomicU64, Ordering};

static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Called from the tick handler with the milliseconds per tick.
pub fn advance(ms: u64) {
    UPTIME_MS.fetch_add(ms, Ordering::Relaxed);
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}
