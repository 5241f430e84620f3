//! SQLite store implementation
//!
//! A single-file database accessed through sqlx. Timestamps are stored as
//! unix milliseconds so the timestamp-indexed log tables and the time-series
//! bucket arithmetic stay in plain integer math. Migrations are idempotent
//! `CREATE ... IF NOT EXISTS` statements.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::models::{
    ApiKeyRecord, AuditLogEntry, CredentialSource, Model, PricingSource, Provider, ProviderKind,
    RequestLogEntry, RewardEntry, RouteMode, RoutingConfig, TimeSeriesPoint,
};

use super::storage::{RewardSummary, Store, StoreError, VaultBlob};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS models (
        id TEXT PRIMARY KEY,
        provider_id TEXT NOT NULL,
        weight INTEGER NOT NULL DEFAULT 0,
        max_context_tokens INTEGER NOT NULL,
        input_per_1k REAL NOT NULL,
        output_per_1k REAL NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        pricing_source TEXT NOT NULL DEFAULT 'manual'
    )",
    "CREATE TABLE IF NOT EXISTS providers (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        base_url TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        credential_source TEXT NOT NULL DEFAULT 'env'
    )",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        key_hash TEXT NOT NULL,
        prefix TEXT NOT NULL,
        name TEXT NOT NULL,
        scopes TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        last_used_at INTEGER,
        expires_at INTEGER,
        rotation_days INTEGER NOT NULL DEFAULT 0,
        monthly_budget_usd REAL NOT NULL DEFAULT 0,
        rps_override INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix)",
    "CREATE TABLE IF NOT EXISTS request_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        model_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        estimated_cost_usd REAL NOT NULL,
        latency_ms INTEGER NOT NULL,
        status INTEGER NOT NULL,
        error_class TEXT,
        request_id TEXT NOT NULL,
        api_key_id TEXT,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_request_logs_key ON request_logs(api_key_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS reward_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        request_id TEXT NOT NULL,
        model_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        estimated_tokens INTEGER NOT NULL,
        token_bucket TEXT NOT NULL,
        latency_budget_ms INTEGER NOT NULL,
        latency_ms INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        success INTEGER NOT NULL,
        error_class TEXT,
        reward REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_reward_logs_timestamp ON reward_logs(timestamp)",
    "CREATE TABLE IF NOT EXISTS audit_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        detail TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS routing_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        default_mode TEXT NOT NULL,
        default_max_budget_usd REAL NOT NULL,
        default_max_latency_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS vault_blob (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        salt_b64 TEXT NOT NULL,
        data_b64 TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ts_points (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        metric TEXT NOT NULL,
        model_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        value REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ts_points_metric ON ts_points(metric, timestamp)",
];

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn opt_ms(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(ms)
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database named by the DSN.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(dsn, "sqlite store connected");
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection so every query sees
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn model_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Model, StoreError> {
        Ok(Model {
            id: row.try_get("id")?,
            provider_id: row.try_get("provider_id")?,
            weight: row.try_get("weight")?,
            max_context_tokens: row.try_get::<i64, _>("max_context_tokens")? as u32,
            input_per_1k: row.try_get("input_per_1k")?,
            output_per_1k: row.try_get("output_per_1k")?,
            enabled: row.try_get("enabled")?,
            pricing_source: PricingSource::parse(&row.try_get::<String, _>("pricing_source")?),
        })
    }

    fn provider_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Provider, StoreError> {
        let kind_str: String = row.try_get("kind")?;
        let kind = ProviderKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown provider kind {kind_str:?}")))?;
        Ok(Provider {
            id: row.try_get("id")?,
            kind,
            base_url: row.try_get("base_url")?,
            enabled: row.try_get("enabled")?,
            credential_source: CredentialSource::parse(
                &row.try_get::<String, _>("credential_source")?,
            ),
        })
    }

    fn api_key_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKeyRecord, StoreError> {
        Ok(ApiKeyRecord {
            id: row.try_get("id")?,
            key_hash: row.try_get("key_hash")?,
            prefix: row.try_get("prefix")?,
            name: row.try_get("name")?,
            scopes: row.try_get("scopes")?,
            created_at: from_ms(row.try_get("created_at")?),
            last_used_at: row.try_get::<Option<i64>, _>("last_used_at")?.map(from_ms),
            expires_at: row.try_get::<Option<i64>, _>("expires_at")?.map(from_ms),
            rotation_days: row.try_get("rotation_days")?,
            monthly_budget_usd: row.try_get("monthly_budget_usd")?,
            rps_override: row.try_get::<i64, _>("rps_override")? as i32,
            enabled: row.try_get("enabled")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_model(&self, model: &Model) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO models (id, provider_id, weight, max_context_tokens, input_per_1k,
                                 output_per_1k, enabled, pricing_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                provider_id = excluded.provider_id,
                weight = excluded.weight,
                max_context_tokens = excluded.max_context_tokens,
                input_per_1k = excluded.input_per_1k,
                output_per_1k = excluded.output_per_1k,
                enabled = excluded.enabled,
                pricing_source = excluded.pricing_source",
        )
        .bind(&model.id)
        .bind(&model.provider_id)
        .bind(model.weight)
        .bind(model.max_context_tokens as i64)
        .bind(model.input_per_1k)
        .bind(model.output_per_1k)
        .bind(model.enabled)
        .bind(model.pricing_source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_model(&self, id: &str) -> Result<Option<Model>, StoreError> {
        let row = sqlx::query("SELECT * FROM models WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::model_from_row).transpose()
    }

    async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        let rows = sqlx::query("SELECT * FROM models ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::model_from_row).collect()
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO providers (id, kind, base_url, enabled, credential_source)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                base_url = excluded.base_url,
                enabled = excluded.enabled,
                credential_source = excluded.credential_source",
        )
        .bind(&provider.id)
        .bind(provider.kind.as_str())
        .bind(&provider.base_url)
        .bind(provider.enabled)
        .bind(provider.credential_source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let rows = sqlx::query("SELECT * FROM providers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::provider_from_row).collect()
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_keys (id, key_hash, prefix, name, scopes, created_at, last_used_at,
                                   expires_at, rotation_days, monthly_budget_usd, rps_override, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.prefix)
        .bind(&key.name)
        .bind(&key.scopes)
        .bind(ms(key.created_at))
        .bind(opt_ms(key.last_used_at))
        .bind(opt_ms(key.expires_at))
        .bind(key.rotation_days)
        .bind(key.monthly_budget_usd)
        .bind(key.rps_override as i64)
        .bind(key.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_api_key(&self, key: &ApiKeyRecord) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE api_keys SET key_hash = ?2, prefix = ?3, name = ?4, scopes = ?5,
                last_used_at = ?6, expires_at = ?7, rotation_days = ?8,
                monthly_budget_usd = ?9, rps_override = ?10, enabled = ?11
             WHERE id = ?1",
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.prefix)
        .bind(&key.name)
        .bind(&key.scopes)
        .bind(opt_ms(key.last_used_at))
        .bind(opt_ms(key.expires_at))
        .bind(key.rotation_days)
        .bind(key.monthly_budget_usd)
        .bind(key.rps_override as i64)
        .bind(key.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::api_key_from_row).transpose()
    }

    async fn list_api_keys(&self, enabled_only: bool) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let sql = if enabled_only {
            "SELECT * FROM api_keys WHERE enabled = 1 ORDER BY created_at"
        } else {
            "SELECT * FROM api_keys ORDER BY created_at"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::api_key_from_row).collect()
    }

    async fn touch_api_key(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(ms(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_request_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO request_logs (timestamp, model_id, provider_id, mode, estimated_cost_usd,
                latency_ms, status, error_class, request_id, api_key_id,
                input_tokens, output_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(ms(entry.timestamp))
        .bind(&entry.model_id)
        .bind(&entry.provider_id)
        .bind(entry.mode.as_str())
        .bind(entry.estimated_cost_usd)
        .bind(entry.latency_ms as i64)
        .bind(entry.status as i64)
        .bind(&entry.error_class)
        .bind(&entry.request_id)
        .bind(&entry.api_key_id)
        .bind(entry.input_tokens as i64)
        .bind(entry.output_tokens as i64)
        .bind(entry.total_tokens as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reward(&self, entry: &RewardEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reward_logs (timestamp, request_id, model_id, provider_id, mode,
                estimated_tokens, token_bucket, latency_budget_ms, latency_ms,
                cost_usd, success, error_class, reward)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(ms(entry.timestamp))
        .bind(&entry.request_id)
        .bind(&entry.model_id)
        .bind(&entry.provider_id)
        .bind(entry.mode.as_str())
        .bind(entry.estimated_tokens as i64)
        .bind(&entry.token_bucket)
        .bind(entry.latency_budget_ms as i64)
        .bind(entry.latency_ms as i64)
        .bind(entry.cost_usd)
        .bind(entry.success)
        .bind(&entry.error_class)
        .bind(entry.reward)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO audit_logs (timestamp, actor, action, detail) VALUES (?1, ?2, ?3, ?4)")
            .bind(ms(entry.timestamp))
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(&entry.detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_request_logs(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM request_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn monthly_spend(
        &self,
        api_key_id: &str,
        month_start: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(estimated_cost_usd), 0.0) AS spend
             FROM request_logs WHERE api_key_id = ?1 AND timestamp >= ?2",
        )
        .bind(api_key_id)
        .bind(ms(month_start))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("spend")?)
    }

    async fn reward_summaries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RewardSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT model_id, token_bucket,
                    SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) AS successes,
                    SUM(CASE WHEN success = 1 THEN 0 ELSE 1 END) AS failures,
                    SUM(reward) AS sum_reward,
                    SUM(reward * reward) AS sum_reward_sq,
                    COUNT(*) AS count
             FROM reward_logs WHERE timestamp >= ?1
             GROUP BY model_id, token_bucket",
        )
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RewardSummary {
                    model_id: row.try_get("model_id")?,
                    token_bucket: row.try_get("token_bucket")?,
                    successes: row.try_get::<i64, _>("successes")? as u64,
                    failures: row.try_get::<i64, _>("failures")? as u64,
                    sum_reward: row.try_get("sum_reward")?,
                    sum_reward_sq: row.try_get("sum_reward_sq")?,
                    count: row.try_get::<i64, _>("count")? as u64,
                })
            })
            .collect()
    }

    async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let requests = sqlx::query("DELETE FROM request_logs WHERE timestamp < ?1")
            .bind(ms(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        let rewards = sqlx::query("DELETE FROM reward_logs WHERE timestamp < ?1")
            .bind(ms(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(requests + rewards)
    }

    async fn insert_ts_points(&self, points: &[TimeSeriesPoint]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query(
                "INSERT INTO ts_points (timestamp, metric, model_id, provider_id, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(ms(point.timestamp))
            .bind(&point.metric)
            .bind(&point.model_id)
            .bind(&point.provider_id)
            .bind(point.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_ts_points(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        model_id: Option<&str>,
        provider_id: Option<&str>,
    ) -> Result<Vec<TimeSeriesPoint>, StoreError> {
        let mut sql = String::from(
            "SELECT timestamp, metric, model_id, provider_id, value FROM ts_points
             WHERE metric = ?1 AND timestamp >= ?2 AND timestamp < ?3",
        );
        if model_id.is_some() {
            sql.push_str(" AND model_id = ?4");
        }
        if provider_id.is_some() {
            sql.push_str(if model_id.is_some() {
                " AND provider_id = ?5"
            } else {
                " AND provider_id = ?4"
            });
        }
        sql.push_str(" ORDER BY timestamp");

        let mut query = sqlx::query(&sql).bind(metric).bind(ms(start)).bind(ms(end));
        if let Some(model_id) = model_id {
            query = query.bind(model_id);
        }
        if let Some(provider_id) = provider_id {
            query = query.bind(provider_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TimeSeriesPoint {
                    timestamp: from_ms(row.try_get("timestamp")?),
                    metric: row.try_get("metric")?,
                    model_id: row.try_get("model_id")?,
                    provider_id: row.try_get("provider_id")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    async fn prune_ts_points(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(sqlx::query("DELETE FROM ts_points WHERE timestamp < ?1")
            .bind(ms(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn get_routing_config(&self) -> Result<Option<RoutingConfig>, StoreError> {
        let row = sqlx::query("SELECT * FROM routing_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(RoutingConfig {
                default_mode: RouteMode::parse(&row.try_get::<String, _>("default_mode")?)
                    .unwrap_or_default(),
                default_max_budget_usd: row.try_get("default_max_budget_usd")?,
                default_max_latency_ms: row.try_get::<i64, _>("default_max_latency_ms")? as u64,
            })
        })
        .transpose()
    }

    async fn put_routing_config(&self, config: &RoutingConfig) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO routing_config (id, default_mode, default_max_budget_usd, default_max_latency_ms)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                default_mode = excluded.default_mode,
                default_max_budget_usd = excluded.default_max_budget_usd,
                default_max_latency_ms = excluded.default_max_latency_ms",
        )
        .bind(config.default_mode.as_str())
        .bind(config.default_max_budget_usd)
        .bind(config.default_max_latency_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_vault_blob(&self) -> Result<Option<VaultBlob>, StoreError> {
        let row = sqlx::query("SELECT salt_b64, data_b64 FROM vault_blob WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(VaultBlob {
                salt_b64: row.try_get("salt_b64")?,
                data_b64: row.try_get("data_b64")?,
            })
        })
        .transpose()
    }

    async fn put_vault_blob(&self, blob: &VaultBlob) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vault_blob (id, salt_b64, data_b64) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                salt_b64 = excluded.salt_b64,
                data_b64 = excluded.data_b64",
        )
        .bind(&blob.salt_b64)
        .bind(&blob.data_b64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn model() -> Model {
        Model {
            id: "gpt-4o".into(),
            provider_id: "openai".into(),
            weight: 5,
            max_context_tokens: 128_000,
            input_per_1k: 0.0025,
            output_per_1k: 0.01,
            enabled: true,
            pricing_source: PricingSource::Litellm,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn model_upsert_round_trips() {
        let store = store().await;
        let m = model();
        store.upsert_model(&m).await.unwrap();

        let got = store.get_model("gpt-4o").await.unwrap().unwrap();
        assert_eq!(got.provider_id, m.provider_id);
        assert_eq!(got.max_context_tokens, m.max_context_tokens);
        assert_eq!(got.pricing_source, PricingSource::Litellm);

        // Upsert replaces in place.
        let mut changed = m.clone();
        changed.weight = 9;
        store.upsert_model(&changed).await.unwrap();
        assert_eq!(store.get_model("gpt-4o").await.unwrap().unwrap().weight, 9);
        assert_eq!(store.list_models().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn monthly_spend_sums_entries_for_key() {
        let store = store().await;
        let month_start = Utc::now() - chrono::Duration::days(1);
        for cost in [1.0, 2.0, 3.0] {
            store
                .insert_request_log(&RequestLogEntry {
                    timestamp: Utc::now(),
                    model_id: "m".into(),
                    provider_id: "p".into(),
                    mode: RouteMode::Normal,
                    estimated_cost_usd: cost,
                    latency_ms: 10,
                    status: 200,
                    error_class: None,
                    request_id: "r".into(),
                    api_key_id: Some("key1".into()),
                    input_tokens: 1,
                    output_tokens: 1,
                    total_tokens: 2,
                })
                .await
                .unwrap();
        }
        let spend = store.monthly_spend("key1", month_start).await.unwrap();
        assert!((spend - 6.0).abs() < 1e-9);
        assert_eq!(store.monthly_spend("other", month_start).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn reward_summaries_group_by_model_and_bucket() {
        let store = store().await;
        let entry = |model: &str, bucket: &str, success: bool, reward: f64| RewardEntry {
            timestamp: Utc::now(),
            request_id: "r".into(),
            model_id: model.into(),
            provider_id: "p".into(),
            mode: RouteMode::Normal,
            estimated_tokens: 100,
            token_bucket: bucket.into(),
            latency_budget_ms: 1000,
            latency_ms: 100,
            cost_usd: 0.01,
            success,
            error_class: None,
            reward,
        };
        store.insert_reward(&entry("m1", "s", true, 0.8)).await.unwrap();
        store.insert_reward(&entry("m1", "s", false, 0.0)).await.unwrap();
        store.insert_reward(&entry("m1", "m", true, 0.6)).await.unwrap();

        let mut summaries = store
            .reward_summaries(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        summaries.sort_by(|a, b| a.token_bucket.cmp(&b.token_bucket));

        assert_eq!(summaries.len(), 2);
        let s_bucket = summaries.iter().find(|s| s.token_bucket == "s").unwrap();
        assert_eq!(s_bucket.successes, 1);
        assert_eq!(s_bucket.failures, 1);
        assert!((s_bucket.sum_reward - 0.8).abs() < 1e-9);
        assert_eq!(s_bucket.count, 2);
    }

    #[tokio::test]
    async fn ts_points_filter_by_model_and_range() {
        let store = store().await;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let point = |offset_ms: i64, model: &str, value: f64| TimeSeriesPoint {
            timestamp: base + chrono::Duration::milliseconds(offset_ms),
            metric: "latency_ms".into(),
            model_id: model.into(),
            provider_id: "p".into(),
            value,
        };
        store
            .insert_ts_points(&[point(0, "m1", 1.0), point(500, "m2", 2.0), point(5000, "m1", 3.0)])
            .await
            .unwrap();

        let points = store
            .query_ts_points(
                "latency_ms",
                base,
                base + chrono::Duration::milliseconds(1000),
                Some("m1"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1.0);

        let pruned = store
            .prune_ts_points(base + chrono::Duration::milliseconds(1000))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
    }

    #[tokio::test]
    async fn routing_config_and_vault_blob_singletons() {
        let store = store().await;
        assert!(store.get_routing_config().await.unwrap().is_none());

        let config = RoutingConfig {
            default_mode: RouteMode::Cheap,
            default_max_budget_usd: 2.5,
            default_max_latency_ms: 9000,
        };
        store.put_routing_config(&config).await.unwrap();
        let got = store.get_routing_config().await.unwrap().unwrap();
        assert_eq!(got.default_mode, RouteMode::Cheap);
        assert_eq!(got.default_max_latency_ms, 9000);

        store
            .put_vault_blob(&VaultBlob {
                salt_b64: "c2FsdA==".into(),
                data_b64: "ZGF0YQ==".into(),
            })
            .await
            .unwrap();
        let blob = store.get_vault_blob().await.unwrap().unwrap();
        assert_eq!(blob.salt_b64, "c2FsdA==");
    }

    #[tokio::test]
    async fn api_key_lifecycle() {
        let store = store().await;
        let key = ApiKeyRecord {
            id: "0123456789abcdef".into(),
            key_hash: "$2b$10$hash".into(),
            prefix: "tokenhub_01234567".into(),
            name: "ci".into(),
            scopes: r#"["chat"]"#.into(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            rotation_days: 30,
            monthly_budget_usd: 5.0,
            rps_override: -1,
            enabled: true,
        };
        store.insert_api_key(&key).await.unwrap();

        let got = store.get_api_key(&key.id).await.unwrap().unwrap();
        assert_eq!(got.rps_override, -1);
        assert_eq!(got.monthly_budget_usd, 5.0);

        let mut disabled = got.clone();
        disabled.enabled = false;
        store.update_api_key(&disabled).await.unwrap();
        assert!(store.list_api_keys(true).await.unwrap().is_empty());
        assert_eq!(store.list_api_keys(false).await.unwrap().len(), 1);

        let at = Utc::now();
        store.touch_api_key(&key.id, at).await.unwrap();
        let touched = store.get_api_key(&key.id).await.unwrap().unwrap();
        assert!(touched.last_used_at.is_some());
    }
}
