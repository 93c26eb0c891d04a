//! Token-bucket rate limiting keyed by client identity.
//!
//! Each client key owns a bucket of `burst` tokens refilled at `rps`
//! tokens per second on a monotonic clock. The default key is the direct
//! peer address; deployments behind a trusted proxy configure a header
//! (e.g. `X-Forwarded-For`) whose first value becomes the key instead.
//!
//! Memory stays bounded: when the bucket map exceeds its cap, the oldest
//! buckets (by last refill) are evicted in a single batch, so an attacker
//! spinning source addresses cannot grow the map without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Hard cap on tracked client keys.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Maximum evictions per overflow, to bound time under the lock.
const MAX_EVICT_PER_CALL: usize = 2_000;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated_at: Instant,
}

/// An in-memory token-bucket limiter.
pub struct TokenBucketLimiter {
    rps: f64,
    burst: f64,
    max_entries: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketLimiter {
    /// Creates a limiter with the given refill rate and burst capacity.
    #[must_use]
    pub fn new(rps: f64, burst: u32) -> Self {
        Self::with_capacity(rps, burst, MAX_TRACKED_KEYS)
    }

    /// Creates a limiter with an explicit entry cap (test hook).
    #[must_use]
    pub fn with_capacity(rps: f64, burst: u32, max_entries: usize) -> Self {
        Self {
            rps: rps.max(0.0),
            burst: f64::from(burst.max(1)),
            max_entries,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token for `key` at instant `now`. Returns false when the
    /// bucket is empty.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if buckets.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = buckets
                .iter()
                .map(|(key, bucket)| (key.clone(), bucket.updated_at))
                .collect();
            by_age.sort_by_key(|(_, updated_at)| *updated_at);
            let excess = buckets.len() - self.max_entries + 1;
            for (old_key, _) in by_age.into_iter().take(excess.min(MAX_EVICT_PER_CALL)) {
                buckets.remove(&old_key);
            }
        }

        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.burst,
            updated_at: now,
        });

        let elapsed = now.saturating_duration_since(bucket.updated_at).as_secs_f64();
        if self.rps > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        }
        bucket.updated_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Takes one token for `key` now.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Number of tracked client keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
