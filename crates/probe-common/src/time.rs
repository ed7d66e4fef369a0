//! Monotonic timestamps as seen by kernel hooks.
//!
//! Hooks read time with `bpf_ktime_get_ns`, which is the monotonic clock in
//! nanoseconds. [`Timestamp`] wraps that value and [`Clock`] abstracts the
//! source so the rate limiter can be driven by a manual clock in tests.

use std::{
    fmt,
    ops::{Add, Sub},
    sync::atomic::{AtomicU64, Ordering},
};

use nix::time::{ClockId, clock_gettime};
use serde::{Deserialize, Serialize};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        MonotonicClock.now()
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed from `earlier`, zero if `earlier` is in the future.
    pub const fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, nanos: u64) -> Self::Output {
        Timestamp(self.0.saturating_add(nanos))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = u64;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / NANOS_PER_SEC, self.0 % NANOS_PER_SEC)
    }
}

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// `CLOCK_MONOTONIC`, the same clock used by `bpf_ktime_get_ns`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Timestamp(ts.tv_sec() as u64 * NANOS_PER_SEC + ts.tv_nsec() as u64),
            // CLOCK_MONOTONIC is always available on Linux
            Err(err) => {
                log::warn!("reading monotonic clock: {err}");
                Timestamp(0)
            }
        }
    }
}

/// Clock which only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicU64::new(start.0))
    }

    pub fn advance(&self, nanos: u64) {
        self.0.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, ts: Timestamp) {
        self.0.store(ts.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.0.load(Ordering::SeqCst))
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}
