//! Embedded time-series store
//!
//! Writers append into an in-memory buffer; the buffer flushes to the
//! durable points table when full, on query, and on a background interval.
//! Queries group by (model, provider) and can downsample into fixed-width
//! mean buckets. Retention pruning deletes old rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::models::TimeSeriesPoint;

use super::storage::{Store, StoreError};

/// Metric names written by the request recorder.
pub mod metric {
    pub const LATENCY_MS: &str = "latency_ms";
    pub const COST_USD: &str = "cost_usd";
    pub const TOKENS_TOTAL: &str = "tokens_total";
    pub const ERRORS: &str = "errors";
}

#[derive(Debug, Clone)]
pub struct TsQuery {
    pub metric: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    /// 0 returns raw points; otherwise fixed-width mean buckets.
    pub step_ms: u64,
}

/// One downsampled bucket: `[start, start + step)`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TsBucket {
    pub start: DateTime<Utc>,
    pub value: f64,
    pub count: u64,
}

/// Query result for one (model, provider) pair.
#[derive(Debug, Clone, Serialize)]
pub struct TsSeries {
    pub model_id: String,
    pub provider_id: String,
    pub points: Vec<TimeSeriesPoint>,
    pub buckets: Vec<TsBucket>,
}

pub struct TimeSeriesStore {
    store: Arc<dyn Store>,
    buffer: Mutex<Vec<TimeSeriesPoint>>,
    capacity: usize,
    retention: chrono::Duration,
}

impl TimeSeriesStore {
    pub const DEFAULT_CAPACITY: usize = 1024;
    pub const DEFAULT_RETENTION_DAYS: i64 = 7;

    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            buffer: Mutex::new(Vec::new()),
            capacity: Self::DEFAULT_CAPACITY,
            retention: chrono::Duration::days(Self::DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Append a point; flushes when the buffer reaches capacity.
    pub async fn write(&self, point: TimeSeriesPoint) {
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(point);
            buffer.len() >= self.capacity
        };
        if full {
            self.flush().await;
        }
    }

    /// Drain the buffer into the store. Failures are logged and the points
    /// dropped; telemetry never fails a request.
    pub async fn flush(&self) {
        let points: Vec<TimeSeriesPoint> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if points.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_ts_points(&points).await {
            error!(error = %e, dropped = points.len(), "time-series flush failed");
        }
    }

    /// Query a metric over a time range, grouped by (model, provider). With
    /// `step_ms > 0`, every series carries `ceil((end-start)/step)` buckets
    /// whose value is the mean of contained points.
    pub async fn query(&self, q: &TsQuery) -> Result<Vec<TsSeries>, StoreError> {
        self.flush().await;
        let points = self
            .store
            .query_ts_points(
                &q.metric,
                q.start,
                q.end,
                q.model_id.as_deref(),
                q.provider_id.as_deref(),
            )
            .await?;

        let mut series: Vec<TsSeries> = Vec::new();
        for point in points {
            let key = (point.model_id.clone(), point.provider_id.clone());
            match series
                .iter_mut()
                .find(|s| s.model_id == key.0 && s.provider_id == key.1)
            {
                Some(existing) => existing.points.push(point),
                None => series.push(TsSeries {
                    model_id: key.0,
                    provider_id: key.1,
                    points: vec![point],
                    buckets: Vec::new(),
                }),
            }
        }

        if q.step_ms > 0 {
            for s in &mut series {
                s.buckets = downsample(&s.points, q.start, q.end, q.step_ms);
            }
        }
        Ok(series)
    }

    /// Delete points older than the retention window.
    pub async fn prune(&self) -> Result<u64, StoreError> {
        self.store.prune_ts_points(Utc::now() - self.retention).await
    }

    /// Background flush/prune loop.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        flush_interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush().await,
                _ = stop.changed() => {
                    debug!("time-series flush loop stopping");
                    self.flush().await;
                    return;
                }
            }
        }
    }
}

/// Average points into aligned `[t - t mod step, t - t mod step + step)`
/// buckets covering `[start, end)`.
fn downsample(
    points: &[TimeSeriesPoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_ms: u64,
) -> Vec<TsBucket> {
    let step = step_ms as i64;
    let start_ms = start.timestamp_millis();
    let end_ms = end.timestamp_millis();
    let first = start_ms - start_ms.rem_euclid(step);

    let mut buckets = Vec::new();
    let mut bucket_start = first;
    while bucket_start < end_ms {
        let bucket_end = bucket_start + step;
        let mut sum = 0.0;
        let mut count = 0u64;
        for point in points {
            let t = point.timestamp.timestamp_millis();
            if t >= bucket_start && t < bucket_end {
                sum += point.value;
                count += 1;
            }
        }
        buckets.push(TsBucket {
            start: Utc
                .timestamp_millis_opt(bucket_start)
                .single()
                .unwrap_or(start),
            value: if count > 0 { sum / count as f64 } else { 0.0 },
            count,
        });
        bucket_start = bucket_end;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite_storage::SqliteStore;

    async fn tsdb() -> TimeSeriesStore {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        TimeSeriesStore::new(store)
    }

    fn point(base: DateTime<Utc>, offset_ms: i64, value: f64) -> TimeSeriesPoint {
        TimeSeriesPoint {
            timestamp: base + chrono::Duration::milliseconds(offset_ms),
            metric: metric::LATENCY_MS.into(),
            model_id: "m1".into(),
            provider_id: "p1".into(),
            value,
        }
    }

    #[tokio::test]
    async fn bucket_count_matches_range_over_step() {
        let tsdb = tsdb().await;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();

        for (offset, value) in [(0, 10.0), (500, 20.0), (1500, 30.0), (3500, 40.0)] {
            tsdb.write(point(base, offset, value)).await;
        }

        let series = tsdb
            .query(&TsQuery {
                metric: metric::LATENCY_MS.into(),
                start: base,
                end: base + chrono::Duration::milliseconds(4000),
                model_id: None,
                provider_id: None,
                step_ms: 1000,
            })
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        let buckets = &series[0].buckets;
        // ceil((end - start) / step) buckets, aligned start.
        assert_eq!(buckets.len(), 4);
        assert!((buckets[0].value - 15.0).abs() < 1e-9); // mean of 10, 20
        assert!((buckets[1].value - 30.0).abs() < 1e-9);
        assert_eq!(buckets[2].count, 0);
        assert!((buckets[3].value - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn query_groups_by_model_and_provider() {
        let tsdb = tsdb().await;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();

        tsdb.write(point(base, 0, 1.0)).await;
        let mut other = point(base, 100, 2.0);
        other.model_id = "m2".into();
        tsdb.write(other).await;

        let series = tsdb
            .query(&TsQuery {
                metric: metric::LATENCY_MS.into(),
                start: base,
                end: base + chrono::Duration::seconds(1),
                model_id: None,
                provider_id: None,
                step_ms: 0,
            })
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
    }

    #[tokio::test]
    async fn buffer_flushes_at_capacity() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let tsdb = TimeSeriesStore::new(store.clone()).with_capacity(2);
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();

        tsdb.write(point(base, 0, 1.0)).await;
        let stored = store
            .query_ts_points(
                metric::LATENCY_MS,
                base - chrono::Duration::hours(1),
                base + chrono::Duration::hours(1),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(stored.is_empty());

        tsdb.write(point(base, 1, 2.0)).await;
        let stored = store
            .query_ts_points(
                metric::LATENCY_MS,
                base - chrono::Duration::hours(1),
                base + chrono::Duration::hours(1),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }
}
