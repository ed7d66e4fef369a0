//! Token bucket admission control.
//!
//! Buckets are stored in a fixed table and updated with atomics only, so
//! `allow` can be called concurrently from any hook without waiting.

use std::sync::atomic::{AtomicU64, Ordering};

use probe_common::time::{Clock, MonotonicClock, NANOS_PER_SEC, Timestamp};

use crate::slot_store::hash_index;

pub const DEFAULT_BUCKETS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of tokens in a bucket
    pub capacity: u64,
    /// Tokens added per second
    pub rate: u64,
}

/// A single token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: AtomicU64,
    last_refill: AtomicU64,
}

impl TokenBucket {
    pub fn new(capacity: u64, now: Timestamp) -> Self {
        Self {
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(now.as_nanos()),
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Add the tokens accumulated since the last refill.
    ///
    /// Only the invocation which manages to move `last_refill` forward adds
    /// tokens. The timestamp advances by the time actually converted into
    /// tokens, so fractions of a token are not lost.
    fn refill(&self, limits: &Limits, now: Timestamp) {
        if limits.rate == 0 {
            return;
        }
        let last = self.last_refill.load(Ordering::Acquire);
        let elapsed = now.as_nanos().saturating_sub(last);
        let new_tokens = (elapsed as u128 * limits.rate as u128 / NANOS_PER_SEC as u128) as u64;
        if new_tokens == 0 {
            return;
        }
        let consumed = (new_tokens as u128 * NANOS_PER_SEC as u128 / limits.rate as u128) as u64;
        if self
            .last_refill
            .compare_exchange(last, last + consumed, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // someone else refilled in the meantime
            return;
        }
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(new_tokens).min(limits.capacity))
            });
    }

    /// Refill, then try to take `cost` tokens.
    pub fn allow(&self, limits: &Limits, cost: u64, now: Timestamp) -> bool {
        self.refill(limits, now);
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(cost)
            })
            .is_ok()
    }
}

/// Per key rate limiter. Keys hashing to the same bucket share it.
pub struct RateLimiter<C = MonotonicClock> {
    limits: Limits,
    buckets: Box<[TokenBucket]>,
    mask: usize,
    clock: C,
}

impl RateLimiter {
    pub fn new(limits: Limits, buckets: usize) -> Self {
        Self::with_clock(limits, buckets, MonotonicClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(limits: Limits, buckets: usize, clock: C) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        let now = clock.now();
        Self {
            limits,
            buckets: (0..buckets)
                .map(|_| TokenBucket::new(limits.capacity, now))
                .collect(),
            mask: buckets - 1,
            clock,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn allow(&self, key: u64, cost: u64) -> bool {
        let bucket = &self.buckets[hash_index(key, self.mask)];
        bucket.allow(&self.limits, cost, self.clock.now())
    }
}

/// Rate limiter with a static list of requests which are always admitted.
pub struct AdmissionGate<C = MonotonicClock> {
    limiter: RateLimiter<C>,
    important: Box<[u32]>,
}

impl<C: Clock> AdmissionGate<C> {
    pub fn new(limiter: RateLimiter<C>, important: impl IntoIterator<Item = u32>) -> Self {
        Self {
            limiter,
            important: important.into_iter().collect(),
        }
    }

    pub fn is_important(&self, request: u32) -> bool {
        self.important.contains(&request)
    }

    /// Admit `request` issued on behalf of `key`.
    pub fn admit(&self, request: u32, key: u64) -> bool {
        self.is_important(request) || self.limiter.allow(key, 1)
    }
}
