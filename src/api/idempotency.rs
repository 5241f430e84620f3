//! TTL-bounded idempotency replay cache
//!
//! Stores the first completed response per `Idempotency-Key` and replays it
//! for duplicates inside the TTL window. At capacity the entry with the
//! earliest creation time is evicted; a cleanup loop prunes expired entries
//! every `ttl / 2`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

/// One cached response: body, status, and the headers worth replaying.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub created_at: Instant,
}

pub struct IdempotencyCache {
    inner: Mutex<HashMap<String, CachedResponse>>,
    ttl: Duration,
    max_entries: usize,
}

impl IdempotencyCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch a live entry; expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        match inner.get(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => Some(entry.clone()),
            Some(_) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a completed response. The first write wins; at capacity the
    /// oldest entry is evicted.
    pub fn set(&self, key: &str, body: Bytes, status: u16, headers: Vec<(String, String)>) {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        if inner.contains_key(key) {
            return;
        }
        if inner.len() >= self.max_entries {
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&oldest);
            }
        }
        inner.insert(
            key.to_string(),
            CachedResponse {
                body,
                status,
                headers,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        let before = inner.len();
        inner.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cleanup loop; runs every `ttl / 2`, at least every second.
    pub async fn run_prune_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let every = (self.ttl / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = self.prune();
                    if pruned > 0 {
                        debug!(pruned, "idempotency cache pruned expired entries");
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}
