//! Bundled model pricing table and the background refresher
//!
//! Models whose pricing source is `litellm` pick up prices from this
//! litellm-style table; `manual` models are never touched. The refresher
//! runs a single attempt per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::PricingSource;

use super::routing::RoutingEngine;
use super::storage::Store;

lazy_static! {
    /// (input, output) USD per 1 000 tokens.
    static ref DEFAULT_PRICES: HashMap<&'static str, (f64, f64)> = {
        let mut prices = HashMap::new();
        prices.insert("gpt-4o", (0.0025, 0.01));
        prices.insert("gpt-4o-mini", (0.00015, 0.0006));
        prices.insert("gpt-4-turbo", (0.01, 0.03));
        prices.insert("gpt-4", (0.03, 0.06));
        prices.insert("gpt-3.5-turbo", (0.0005, 0.0015));
        prices.insert("o3-mini", (0.0011, 0.0044));
        prices.insert("claude-3-5-sonnet-latest", (0.003, 0.015));
        prices.insert("claude-3-5-haiku-latest", (0.0008, 0.004));
        prices.insert("claude-3-opus-latest", (0.015, 0.075));
        prices.insert("claude-3-haiku-20240307", (0.00025, 0.00125));
        prices
    };
}

/// Look up bundled pricing for a model id.
pub fn lookup(model_id: &str) -> Option<(f64, f64)> {
    DEFAULT_PRICES.get(model_id).copied()
}

/// Refresh prices for litellm-sourced models; returns how many changed.
pub async fn refresh(engine: &RoutingEngine, store: &dyn Store) -> usize {
    let mut updated = 0usize;
    for mut model in engine.models().await {
        if model.pricing_source != PricingSource::Litellm {
            continue;
        }
        let Some((input_per_1k, output_per_1k)) = lookup(&model.id) else {
            debug!(model = %model.id, "no bundled pricing for litellm-sourced model");
            continue;
        };
        if (model.input_per_1k - input_per_1k).abs() < f64::EPSILON
            && (model.output_per_1k - output_per_1k).abs() < f64::EPSILON
        {
            continue;
        }
        model.input_per_1k = input_per_1k;
        model.output_per_1k = output_per_1k;
        if let Err(e) = store.upsert_model(&model).await {
            warn!(model = %model.id, error = %e, "pricing refresh persist failed");
            continue;
        }
        engine.upsert_model(model).await;
        updated += 1;
    }
    if updated > 0 {
        info!(updated, "model pricing refreshed");
    }
    updated
}

/// Background loop; one refresh attempt per cycle.
pub async fn run_refresher(
    engine: Arc<RoutingEngine>,
    store: Arc<dyn Store>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh(engine.as_ref(), store.as_ref()).await;
            }
            _ = stop.changed() => {
                debug!("pricing refresher stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bandit::BanditPolicy;
    use crate::engine::events::EventBus;
    use crate::engine::health::HealthTracker;
    use crate::engine::sqlite_storage::SqliteStore;
    use crate::models::{Model, RoutingConfig};

    #[tokio::test]
    async fn refresh_updates_only_litellm_models() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let engine = RoutingEngine::new(
            RoutingConfig::default(),
            Arc::new(HealthTracker::new(bus.clone())),
            Arc::new(BanditPolicy::new(0.0)),
            bus,
        );

        let make = |id: &str, source: PricingSource| Model {
            id: id.into(),
            provider_id: "openai".into(),
            weight: 0,
            max_context_tokens: 128_000,
            input_per_1k: 99.0,
            output_per_1k: 99.0,
            enabled: true,
            pricing_source: source,
        };
        engine.upsert_model(make("gpt-4o", PricingSource::Litellm)).await;
        engine.upsert_model(make("gpt-4", PricingSource::Manual)).await;

        let updated = refresh(&engine, store.as_ref()).await;
        assert_eq!(updated, 1);

        let refreshed = engine.model("gpt-4o").await.unwrap();
        assert!((refreshed.input_per_1k - 0.0025).abs() < 1e-12);
        let manual = engine.model("gpt-4").await.unwrap();
        assert_eq!(manual.input_per_1k, 99.0);
    }
}
