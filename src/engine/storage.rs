// Storage abstraction for TokenHub
// Defines the durable interface the engine, managers and loops depend on,
// plus the async write queue that keeps handler tasks off the SQLite writer.

//! # Storage Abstraction Layer
//!
//! The store is the durable source of truth: models, providers, API keys,
//! the request/reward/audit logs, the routing-config singleton, the vault
//! blob and the time-series points table.
//!
//! ## Async Design
//!
//! All operations are async and fallible. Telemetry writes never touch the
//! store directly from a request task; they go through [`WriteQueue`], a
//! bounded queue with a single drain task, so SQLite's single-writer
//! serialization cannot block request handling. When the queue is full the
//! oldest job is dropped and a warning counter incremented.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::models::{
    ApiKeyRecord, AuditLogEntry, Model, Provider, RequestLogEntry, RewardEntry, RoutingConfig,
    TimeSeriesPoint,
};

/// Storage failures. Logging paths swallow these; control paths propagate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Aggregated reward rows for one (model, token-bucket) arm, as consumed by
/// the bandit refresher.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardSummary {
    pub model_id: String,
    pub token_bucket: String,
    pub successes: u64,
    pub failures: u64,
    pub sum_reward: f64,
    pub sum_reward_sq: f64,
    pub count: u64,
}

/// The persisted vault singleton: PBKDF2 salt plus the encrypted KV blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBlob {
    pub salt_b64: String,
    pub data_b64: String,
}

/// Durable store interface. Implementations must be safe to share across
/// tasks; migrations must be idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn migrate(&self) -> Result<(), StoreError>;

    // -- models and providers ------------------------------------------------
    async fn upsert_model(&self, model: &Model) -> Result<(), StoreError>;
    async fn get_model(&self, id: &str) -> Result<Option<Model>, StoreError>;
    async fn list_models(&self) -> Result<Vec<Model>, StoreError>;
    async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError>;
    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError>;

    // -- api keys ------------------------------------------------------------
    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<(), StoreError>;
    async fn update_api_key(&self, key: &ApiKeyRecord) -> Result<(), StoreError>;
    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
    async fn list_api_keys(&self, enabled_only: bool) -> Result<Vec<ApiKeyRecord>, StoreError>;
    async fn touch_api_key(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    // -- logs ----------------------------------------------------------------
    async fn insert_request_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError>;
    async fn insert_reward(&self, entry: &RewardEntry) -> Result<(), StoreError>;
    async fn insert_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError>;
    async fn count_request_logs(&self) -> Result<u64, StoreError>;
    /// Sum of estimated cost for a key's requests since `month_start`.
    async fn monthly_spend(
        &self,
        api_key_id: &str,
        month_start: DateTime<Utc>,
    ) -> Result<f64, StoreError>;
    /// Reward rows since `since`, grouped by (model, token bucket).
    async fn reward_summaries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RewardSummary>, StoreError>;
    /// Delete request/reward logs older than `cutoff`; returns rows removed.
    async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- time series ---------------------------------------------------------
    async fn insert_ts_points(&self, points: &[TimeSeriesPoint]) -> Result<(), StoreError>;
    async fn query_ts_points(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        model_id: Option<&str>,
        provider_id: Option<&str>,
    ) -> Result<Vec<TimeSeriesPoint>, StoreError>;
    async fn prune_ts_points(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- singletons ----------------------------------------------------------
    async fn get_routing_config(&self) -> Result<Option<RoutingConfig>, StoreError>;
    async fn put_routing_config(&self, config: &RoutingConfig) -> Result<(), StoreError>;
    async fn get_vault_blob(&self) -> Result<Option<VaultBlob>, StoreError>;
    async fn put_vault_blob(&self, blob: &VaultBlob) -> Result<(), StoreError>;
}

/// One queued store write.
#[derive(Debug)]
pub enum WriteJob {
    RequestLog(RequestLogEntry),
    Reward(RewardEntry),
    Audit(AuditLogEntry),
    TouchKey { id: String, at: DateTime<Utc> },
    TsPoints(Vec<TimeSeriesPoint>),
}

struct QueueInner {
    jobs: VecDeque<WriteJob>,
    closed: bool,
}

/// Bounded async write queue with a single drain task.
pub struct WriteQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl WriteQueue {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue without blocking. At capacity, the oldest job is discarded.
    pub fn enqueue(&self, job: WriteJob) {
        {
            let mut inner = self.inner.lock().expect("write queue lock poisoned");
            if inner.closed {
                return;
            }
            if inner.jobs.len() >= self.capacity {
                inner.jobs.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "store write queue full, dropping oldest job");
            }
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Jobs discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop_batch(&self, max: usize) -> (Vec<WriteJob>, bool) {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        let take = inner.jobs.len().min(max);
        let batch = inner.jobs.drain(..take).collect();
        (batch, inner.closed)
    }

    /// Close the queue; the drain worker exits once remaining jobs flush.
    pub fn close(&self) {
        self.inner
            .lock()
            .expect("write queue lock poisoned")
            .closed = true;
        self.notify.notify_one();
    }

    /// Single consumer: drains jobs into the store until closed and empty.
    /// Individual write failures are logged and swallowed; telemetry loss
    /// never fails a request.
    pub async fn run_worker(self: Arc<Self>, store: Arc<dyn Store>) {
        loop {
            let (batch, closed) = self.pop_batch(256);
            if batch.is_empty() {
                if closed {
                    debug!("store write queue drained, worker exiting");
                    return;
                }
                self.notify.notified().await;
                continue;
            }
            for job in batch {
                let result = match &job {
                    WriteJob::RequestLog(entry) => store.insert_request_log(entry).await,
                    WriteJob::Reward(entry) => store.insert_reward(entry).await,
                    WriteJob::Audit(entry) => store.insert_audit(entry).await,
                    WriteJob::TouchKey { id, at } => store.touch_api_key(id, *at).await,
                    WriteJob::TsPoints(points) => store.insert_ts_points(points).await,
                };
                if let Err(e) = result {
                    error!(error = %e, "store write failed");
                }
            }
        }
    }
}
