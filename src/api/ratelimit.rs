//! Token-bucket rate limiting with LRU eviction
//!
//! One bucket per key (client IP or `apikey:<id>`), refilled `rate` tokens
//! per interval up to `burst`. The bucket map is LRU-bounded; admitting a
//! new key at capacity evicts the least-recently-used bucket. A background
//! loop drops buckets idle for more than ten minutes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use prometheus::IntCounter;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_fill: Instant,
    last_seen: Instant,
    rate: u32,
    burst: u32,
    /// Buckets created through `allow_custom` keep their own limits;
    /// default buckets adopt new global limits on the next refill.
    custom: bool,
}

struct Inner {
    rate: u32,
    burst: u32,
    buckets: LruCache<String, Bucket>,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
    interval: Duration,
    counter: Option<IntCounter>,
}

impl RateLimiter {
    pub const DEFAULT_CAPACITY: usize = 10_000;
    pub const IDLE_EVICTION: Duration = Duration::from_secs(600);
    pub const EVICTION_INTERVAL: Duration = Duration::from_secs(300);

    pub fn new(rate: u32, burst: u32, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rate,
                burst,
                buckets: LruCache::new(
                    NonZeroUsize::new(capacity.max(1)).expect("capacity nonzero"),
                ),
            }),
            interval: Duration::from_secs(1),
            counter: None,
        }
    }

    /// Increment `counter` on every denied call.
    pub fn with_counter(mut self, counter: IntCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Admit or deny under the global limits.
    pub fn allow(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        let (rate, burst) = (inner.rate, inner.burst);
        self.allow_inner(&mut inner, key, rate, burst, false)
    }

    /// Admit or deny under per-key limits (API-key overrides).
    pub fn allow_custom(&self, key: &str, rate: u32, burst: u32) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        self.allow_inner(&mut inner, key, rate, burst, true)
    }

    fn allow_inner(
        &self,
        inner: &mut Inner,
        key: &str,
        rate: u32,
        burst: u32,
        custom: bool,
    ) -> bool {
        let now = Instant::now();
        if inner.buckets.get(key).is_none() {
            inner.buckets.push(
                key.to_string(),
                Bucket {
                    tokens: burst as f64,
                    last_fill: now,
                    last_seen: now,
                    rate,
                    burst,
                    custom,
                },
            );
        }
        let (global_rate, global_burst) = (inner.rate, inner.burst);
        let bucket = inner.buckets.get_mut(key).expect("bucket just inserted");
        bucket.last_seen = now;

        if bucket.custom {
            bucket.rate = rate;
            bucket.burst = burst;
        } else {
            // Updated global limits take effect at refill time.
            bucket.rate = global_rate;
            bucket.burst = global_burst;
        }

        let elapsed = now.duration_since(bucket.last_fill);
        let intervals = (elapsed.as_secs_f64() / self.interval.as_secs_f64()).floor();
        if intervals >= 1.0 {
            bucket.tokens =
                (bucket.tokens + intervals * bucket.rate as f64).min(bucket.burst as f64);
            bucket.last_fill += self.interval.mul_f64(intervals);
        }
        bucket.tokens = bucket.tokens.min(bucket.burst as f64);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            if let Some(counter) = &self.counter {
                counter.inc();
            }
            false
        }
    }

    /// Atomically replace the global limits.
    pub fn update_limits(&self, rate: u32, burst: u32) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        inner.rate = rate;
        inner.burst = burst;
    }

    /// Drop buckets idle longer than `idle`; returns how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        let stale: Vec<String> = inner
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.last_seen.elapsed() > idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            inner.buckets.pop(key);
        }
        stale.len()
    }

    /// Background eviction loop.
    pub async fn run_eviction_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Self::EVICTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(Self::IDLE_EVICTION);
                    if evicted > 0 {
                        debug!(evicted, "rate limiter evicted idle buckets");
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}
