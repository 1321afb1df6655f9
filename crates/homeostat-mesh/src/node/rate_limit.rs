//! Per-sender token buckets
//!
//! Each sender gets a bucket holding up to `burst` tokens, refilled at
//! `rate_per_sec`. A message costs one token.
//!
//! Buckets that have refilled to `burst` carry no state and are dropped on
//! [`RateLimiter::prune_idle`]. The table holds at most `max_senders`
//! buckets; a new sender arriving at the cap first sweeps idle buckets, then
//! evicts the least recently used one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Default cap on tracked senders
pub const DEFAULT_MAX_SENDERS: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    updated: Instant,
}

/// Rate limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    /// Senders with a bucket
    pub senders: usize,
    /// Messages rejected so far
    pub blocked_total: u64,
    /// Buckets dropped by sweeps and evictions
    pub evicted_total: u64,
}

/// Token-bucket limiter keyed by sender id
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    max_senders: usize,
    buckets: DashMap<String, TokenBucket>,
    blocked: AtomicU64,
    evicted: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            burst: f64::from(burst.max(1)),
            max_senders: DEFAULT_MAX_SENDERS,
            buckets: DashMap::new(),
            blocked: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn with_max_senders(mut self, max_senders: usize) -> Self {
        self.max_senders = max_senders.max(1);
        self
    }

    /// Take one token for `sender`; false when the sender is over its limit
    pub fn check(&self, sender: &str) -> bool {
        self.check_at(sender, Instant::now())
    }

    fn check_at(&self, sender: &str, now: Instant) -> bool {
        // No map guard may be held across the sweep
        if self.buckets.len() >= self.max_senders && !self.buckets.contains_key(sender) {
            self.make_room(now);
        }

        let mut bucket = self.buckets.entry(sender.to_string()).or_insert(TokenBucket {
            tokens: self.burst,
            updated: now,
        });

        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Drop buckets that have refilled to `burst`; returns how many
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !self.is_idle(bucket, now));
        let removed = before.saturating_sub(self.buckets.len());
        self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn is_idle(&self, bucket: &TokenBucket, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens + elapsed * self.rate_per_sec >= self.burst
    }

    fn make_room(&self, now: Instant) {
        self.prune_idle_at(now);
        while self.buckets.len() >= self.max_senders {
            let stalest = self
                .buckets
                .iter()
                .min_by_key(|entry| entry.value().updated)
                .map(|entry| entry.key().clone());
            let Some(key) = stalest else {
                break;
            };
            if self.buckets.remove(&key).is_some() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Forget every bucket
    pub fn reset(&self) {
        self.buckets.clear();
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            senders: self.buckets.len(),
            blocked_total: self.blocked.load(Ordering::Relaxed),
            evicted_total: self.evicted.load(Ordering::Relaxed),
        }
    }
}
