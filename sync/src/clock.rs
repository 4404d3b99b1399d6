//! Monotonic clock.
//!
//! Replaces the HPET-backed `monotonic_ns`/`uptime_ms` (grounded on
//! `lib/src/clock.rs`) with a process-epoch `std::time::Instant`. Every
//! accessor is safe to call from the event thread, a timer ticker thread, or
//! any user thread.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic time in nanoseconds since the stack's process epoch.
#[inline]
pub fn monotonic_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Convenience wrapper around [`monotonic_ns`] with millisecond granularity.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_ns() / 1_000_000
}

/// Uptime in whole 1ms "ticks", matching the event thread's timer-tick cadence.
#[inline]
pub fn uptime_ticks() -> u64 {
    uptime_ms()
}
