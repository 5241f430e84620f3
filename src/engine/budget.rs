//! Per-key monthly budget enforcement
//!
//! Always reads the month's spend fresh from storage; a cached figure would
//! open a stale over-spend window.

use std::sync::Arc;

use chrono::{Datelike, TimeZone, Utc};

use crate::models::ApiKeyRecord;

use super::storage::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("monthly budget exceeded")]
    Exceeded { budget_usd: f64, spent_usd: f64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BudgetChecker {
    store: Arc<dyn Store>,
}

impl BudgetChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Errors iff the key has a budget and this month's spend has reached it.
    pub async fn check(&self, key: &ApiKeyRecord) -> Result<(), BudgetError> {
        if key.monthly_budget_usd <= 0.0 {
            return Ok(());
        }
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let spent_usd = self.store.monthly_spend(&key.id, month_start).await?;
        if spent_usd >= key.monthly_budget_usd {
            return Err(BudgetError::Exceeded {
                budget_usd: key.monthly_budget_usd,
                spent_usd,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite_storage::SqliteStore;
    use crate::models::{RequestLogEntry, RouteMode};

    fn key(budget: f64) -> ApiKeyRecord {
        ApiKeyRecord {
            id: "key1".into(),
            key_hash: String::new(),
            prefix: String::new(),
            name: "t".into(),
            scopes: "[]".into(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            rotation_days: 0,
            monthly_budget_usd: budget,
            rps_override: 0,
            enabled: true,
        }
    }

    async fn with_spend(spend: &[f64]) -> BudgetChecker {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        for cost in spend {
            store
                .insert_request_log(&RequestLogEntry {
                    timestamp: Utc::now(),
                    model_id: "m".into(),
                    provider_id: "p".into(),
                    mode: RouteMode::Normal,
                    estimated_cost_usd: *cost,
                    latency_ms: 1,
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
        BudgetChecker::new(store)
    }

    #[tokio::test]
    async fn zero_budget_is_unlimited() {
        let checker = with_spend(&[100.0]).await;
        assert!(checker.check(&key(0.0)).await.is_ok());
    }

    #[tokio::test]
    async fn errors_iff_spend_reaches_budget() {
        let checker = with_spend(&[2.0, 2.0, 2.0]).await;
        assert!(checker.check(&key(10.0)).await.is_ok());

        match checker.check(&key(5.0)).await.unwrap_err() {
            BudgetError::Exceeded {
                budget_usd,
                spent_usd,
            } => {
                assert_eq!(budget_usd, 5.0);
                assert!((spent_usd - 6.0).abs() < 1e-9);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Exactly at the budget counts as exceeded.
        assert!(checker.check(&key(6.0)).await.is_err());
    }
}
