//! Elapsed-time sources.
//!
//! All bucket math and pull-delay accounting runs on a monotonic
//! elapsed-nanosecond timeline. The trait exists so tests can drive the
//! engine with a hand-cranked clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Nanoseconds per second.
pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const NS_PER_MS: i64 = 1_000_000;

/// Monotonic elapsed-time source.
pub trait ElapsedClock: Send + Sync {
    /// Nanoseconds elapsed since an arbitrary fixed origin (typically boot).
    fn elapsed_ns(&self) -> i64;
}

/// Production clock backed by [`Instant`], anchored at construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ElapsedClock for MonotonicClock {
    fn elapsed_ns(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Hand-cranked clock for tests.
pub struct FakeClock {
    now_ns: AtomicI64,
}

impl FakeClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(start_ns),
        }
    }

    /// Set the current elapsed time.
    pub fn set_ns(&self, ns: i64) {
        self.now_ns.store(ns, Ordering::Relaxed);
    }

    /// Advance the current elapsed time.
    pub fn advance_ns(&self, delta: i64) {
        self.now_ns.fetch_add(delta, Ordering::Relaxed);
    }
}

impl ElapsedClock for FakeClock {
    fn elapsed_ns(&self) -> i64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}

/// Convert elapsed nanoseconds to elapsed milliseconds.
pub fn nano_to_millis(ns: i64) -> i64 {
    ns / NS_PER_MS
}
