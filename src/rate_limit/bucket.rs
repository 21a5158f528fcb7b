// In-process token bucket per client key.
//
// State is in-memory only and resets on restart. Used when no distributed
// backend is reachable, and as the fallback once a backend outage outlasts
// the fail-open window.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Token bucket for a single client key.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill for the wall-clock time since the last touch, then try to
    /// consume one token.
    fn try_consume(&mut self, capacity: u64, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-key token bucket limiter.
///
/// Buckets are created lazily, full, on the first request for a key.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, TokenBucket>,
    capacity: u64,
    refill_per_sec: f64,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    /// Check and consume one token for `client_key`.
    pub fn allow(&self, client_key: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(client_key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.capacity, self.refill_per_sec)
    }

    /// Drops buckets untouched for `max_idle`. A dropped bucket comes back
    /// full, which is where an idle bucket would have refilled to anyway
    /// once `max_idle` covers a full refill.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < max_idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
