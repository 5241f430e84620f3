// Server assembly for TokenHub
// Wires the store, engine, managers and metrics into an axum application,
// owns the background loops, and runs the bind/serve/drain lifecycle.

//! # Server Module
//!
//! ```text
//! main() (bin/server.rs)
//!   ↓ builds
//! Config + SqliteStore
//!   ↓ assembled by
//! AppState::build ← hydrates the engine from the store + credentials file
//!   ↓ served via
//! build_router ← middleware chain + handlers (api module)
//!   ↓ runs under
//! run() ← bind, background loops, graceful drain, queue flush
//! ```

pub mod dispatch;
pub mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::middleware::{
    access_log_mw, auth_mw, budget_mw, idempotency_mw, ip_ratelimit_mw, key_ratelimit_mw,
    recover_mw, request_id_mw, scope_mw,
};
use crate::api::{handlers, IdempotencyCache, RateLimiter};
use crate::config::Config;
use crate::engine::credentials::{autoload_model_ids, CredentialsFile};
use crate::engine::health::run_prober;
use crate::engine::tsdb::metric;
use crate::engine::{
    bandit, compute_reward, pricing, token_bucket, ApiKeyManager, BanditPolicy, BudgetChecker,
    CircuitBreaker, Event, EventBus, EventKind, HealthTracker, RoutePolicy, RoutingEngine,
    SqliteStore, StatsAggregator, Store, TimeSeriesStore, Vault, WriteJob, WriteQueue,
};
use crate::llm::providers::{build_adapter, env_var_for};
use crate::llm::TokenUsage;
use crate::models::{
    CredentialSource, Model, PricingSource, Provider, ProviderKind, RequestLogEntry, RewardEntry,
    RouteMode, RoutingConfig, TimeSeriesPoint,
};

pub use dispatch::{DispatchRouter, WorkflowDispatcher};
pub use metrics::Metrics;

const HTTP_DRAIN_BUDGET: Duration = Duration::from_secs(30);
const SUBSYSTEM_STOP_BUDGET: Duration = Duration::from_secs(5);
const TSDB_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const PROBER_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const ROTATION_INTERVAL: Duration = Duration::from_secs(3600);
const PRICING_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const LOG_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const LOG_RETENTION_DAYS: i64 = 30;
const TS_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
/// Context window assumed for models registered via autoload probing.
const AUTOLOAD_CONTEXT_TOKENS: u32 = 8192;

/// Shared application state; cheap to clone, all fields are shared handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<RoutingEngine>,
    pub bandit: Arc<BanditPolicy>,
    pub queue: Arc<WriteQueue>,
    pub keys: Arc<ApiKeyManager>,
    pub budget: Arc<BudgetChecker>,
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyCache>,
    pub tsdb: Arc<TimeSeriesStore>,
    pub stats: Arc<StatsAggregator>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub vault: Arc<Vault>,
    pub dispatcher: Arc<DispatchRouter>,
    queue_worker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

/// Everything the telemetry spine records about one completed request.
pub struct RequestRecord {
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub model_id: String,
    pub provider_id: String,
    pub mode: RouteMode,
    pub policy: RoutePolicy,
    pub estimated_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: u16,
    pub error_class: Option<String>,
    pub usage: TokenUsage,
}

impl AppState {
    /// Assemble the application over an already-connected store.
    pub async fn build(config: Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        store.migrate().await.context("store migration failed")?;

        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new());
        let health = Arc::new(HealthTracker::new(bus.clone()));
        let bandit_policy = Arc::new(BanditPolicy::new(bandit::DEFAULT_TEMPERATURE));

        // The persisted routing-config singleton wins; a fresh database is
        // seeded from the environment defaults.
        let defaults = match store.get_routing_config().await? {
            Some(existing) => existing,
            None => {
                let seeded = RoutingConfig {
                    default_mode: config.default_mode,
                    default_max_budget_usd: config.default_max_budget_usd,
                    default_max_latency_ms: config.default_max_latency_ms,
                };
                store.put_routing_config(&seeded).await?;
                seeded
            }
        };

        let engine = Arc::new(RoutingEngine::new(
            defaults,
            health,
            bandit_policy.clone(),
            bus.clone(),
        ));

        let queue = WriteQueue::new(WriteQueue::DEFAULT_CAPACITY);
        let worker = tokio::spawn(queue.clone().run_worker(store.clone()));

        let vault = Arc::new(Vault::new(store.clone()));
        if config.vault_enabled {
            match &config.vault_password {
                Some(password) => vault
                    .unlock(password)
                    .await
                    .context("vault unlock failed")?,
                None => warn!("vault enabled but TOKENHUB_VAULT_PASSWORD unset; vault stays locked"),
            }
        }

        let breaker = {
            let gauge = metrics.temporal_circuit_state.clone();
            Arc::new(CircuitBreaker::default().with_on_change(move |state| {
                gauge.set(state.gauge_value());
            }))
        };
        let workflow: Option<Arc<dyn WorkflowDispatcher>> = None;
        if config.temporal_enabled {
            warn!(
                address = config.temporal_address.as_deref().unwrap_or("unset"),
                "temporal flags set but no workflow client is linked; dispatch stays in-process"
            );
        }
        let dispatcher = Arc::new(DispatchRouter::new(
            engine.clone(),
            workflow,
            breaker,
            metrics.clone(),
            bus.clone(),
        ));

        let limiter = Arc::new(
            RateLimiter::new(
                config.rate_limit_rps,
                config.rate_limit_burst,
                RateLimiter::DEFAULT_CAPACITY,
            )
            .with_counter(metrics.rate_limited_total.clone()),
        );

        let state = Self {
            keys: Arc::new(ApiKeyManager::new(store.clone(), queue.clone())),
            budget: Arc::new(BudgetChecker::new(store.clone())),
            idempotency: Arc::new(IdempotencyCache::new(
                IdempotencyCache::DEFAULT_TTL,
                IdempotencyCache::DEFAULT_MAX_ENTRIES,
            )),
            tsdb: Arc::new(TimeSeriesStore::new(store.clone())),
            stats: Arc::new(StatsAggregator::new(StatsAggregator::DEFAULT_WINDOW)),
            config: Arc::new(config),
            store,
            engine,
            bandit: bandit_policy,
            queue,
            limiter,
            bus,
            metrics,
            vault,
            dispatcher,
            queue_worker: Arc::new(std::sync::Mutex::new(Some(worker))),
        };

        state.hydrate().await?;
        Ok(state)
    }

    /// Load providers and models into the engine: credentials file first
    /// (so its records land in the store), then everything persisted, then
    /// autoload probes.
    async fn hydrate(&self) -> anyhow::Result<()> {
        let mut file = CredentialsFile::default();
        if let Some(path) = &self.config.credentials_file {
            file = CredentialsFile::load(path).context("credentials file rejected")?;
        }

        // Credentials handed to us directly are kept off disk: they go into
        // the vault when it is unlocked, otherwise they stay in memory for
        // this process only.
        let mut file_credentials: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        for entry in &file.providers {
            let kind = ProviderKind::parse(&entry.kind).ok_or_else(|| {
                anyhow::anyhow!("credentials file: unknown provider type {:?}", entry.kind)
            })?;
            let mut credential_source = CredentialSource::Env;
            if let Some(api_key) = &entry.api_key {
                file_credentials.insert(entry.id.clone(), api_key.clone());
                if self.vault.is_unlocked().await {
                    self.vault
                        .put(&format!("provider:{}", entry.id), api_key)
                        .await
                        .ok();
                    credential_source = CredentialSource::Vault;
                }
            }
            self.store
                .upsert_provider(&Provider {
                    id: entry.id.clone(),
                    kind,
                    base_url: entry.base_url.clone(),
                    enabled: entry.enabled,
                    credential_source,
                })
                .await?;
        }
        for entry in &file.models {
            self.store
                .upsert_model(&Model {
                    id: entry.id.clone(),
                    provider_id: entry.provider_id.clone(),
                    weight: entry.weight,
                    max_context_tokens: entry.max_context_tokens,
                    input_per_1k: entry.input_per_1k,
                    output_per_1k: entry.output_per_1k,
                    enabled: entry.enabled,
                    pricing_source: PricingSource::Manual,
                })
                .await?;
        }

        let timeout = Duration::from_secs(self.config.provider_timeout_secs);
        for provider in self.store.list_providers().await? {
            if !provider.enabled {
                continue;
            }
            let credential = match file_credentials.get(&provider.id) {
                Some(key) => Some(key.clone()),
                None => match provider.credential_source {
                    CredentialSource::Env => std::env::var(env_var_for(provider.kind)).ok(),
                    CredentialSource::Vault => match self
                        .vault
                        .get(&format!("provider:{}", provider.id))
                        .await
                    {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(provider = %provider.id, error = %e, "vault credential unavailable");
                            None
                        }
                    },
                    CredentialSource::None => None,
                },
            };
            let adapter = build_adapter(&provider, credential, timeout);
            self.engine.register_provider(provider, adapter).await;
        }
        for model in self.store.list_models().await? {
            self.engine.upsert_model(model).await;
        }

        // Autoload: models advertised upstream register disabled-by-default
        // unless explicitly listed.
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        for entry in file.providers.iter().filter(|p| p.autoload_models && p.enabled) {
            match autoload_model_ids(&client, &entry.base_url, entry.api_key.as_deref()).await {
                Ok(ids) => {
                    for id in ids {
                        if self.engine.model(&id).await.is_some() {
                            continue;
                        }
                        let (input_per_1k, output_per_1k) =
                            pricing::lookup(&id).unwrap_or((0.0, 0.0));
                        let model = Model {
                            id,
                            provider_id: entry.id.clone(),
                            weight: 0,
                            max_context_tokens: AUTOLOAD_CONTEXT_TOKENS,
                            input_per_1k,
                            output_per_1k,
                            enabled: false,
                            pricing_source: PricingSource::Litellm,
                        };
                        self.store.upsert_model(&model).await?;
                        self.engine.upsert_model(model).await;
                    }
                }
                Err(e) => warn!(provider = %entry.id, error = %e, "model autoload failed"),
            }
        }

        info!(
            models = self.engine.models().await.len(),
            adapters = self.engine.adapter_count().await,
            "engine hydrated"
        );
        Ok(())
    }

    /// Record one completed (or failed) request across the whole
    /// observability spine: request log, reward log, time series, windowed
    /// stats, Prometheus, event bus.
    pub async fn record_request(&self, record: RequestRecord) {
        let success = record.status < 400;
        let now = Utc::now();
        let bucket = token_bucket(record.estimated_tokens);

        self.queue.enqueue(WriteJob::RequestLog(RequestLogEntry {
            timestamp: now,
            model_id: record.model_id.clone(),
            provider_id: record.provider_id.clone(),
            mode: record.mode,
            estimated_cost_usd: record.cost_usd,
            latency_ms: record.latency_ms,
            status: record.status,
            error_class: record.error_class.clone(),
            request_id: record.request_id.clone(),
            api_key_id: record.api_key_id.clone(),
            input_tokens: record.usage.prompt_tokens,
            output_tokens: record.usage.completion_tokens,
            total_tokens: record.usage.total_tokens,
        }));

        let reward = compute_reward(
            success,
            record.latency_ms,
            record.policy.max_latency_ms,
            record.cost_usd,
            record.policy.max_budget_usd,
        );
        self.queue.enqueue(WriteJob::Reward(RewardEntry {
            timestamp: now,
            request_id: record.request_id.clone(),
            model_id: record.model_id.clone(),
            provider_id: record.provider_id.clone(),
            mode: record.mode,
            estimated_tokens: record.estimated_tokens,
            token_bucket: bucket.to_string(),
            latency_budget_ms: record.policy.max_latency_ms,
            latency_ms: record.latency_ms,
            cost_usd: record.cost_usd,
            success,
            error_class: record.error_class.clone(),
            reward,
        }));

        self.stats
            .record(&record.model_id, success, record.latency_ms, record.cost_usd);

        let point = |metric_name: &str, value: f64| TimeSeriesPoint {
            timestamp: now,
            metric: metric_name.to_string(),
            model_id: record.model_id.clone(),
            provider_id: record.provider_id.clone(),
            value,
        };
        self.tsdb.write(point(metric::LATENCY_MS, record.latency_ms as f64)).await;
        self.tsdb.write(point(metric::COST_USD, record.cost_usd)).await;
        self.tsdb
            .write(point(metric::TOKENS_TOTAL, record.usage.total_tokens as f64))
            .await;
        if !success {
            self.tsdb.write(point(metric::ERRORS, 1.0)).await;
        }

        let mode = record.mode.as_str();
        let status = record.status.to_string();
        self.metrics
            .requests_total
            .with_label_values(&[mode, &record.model_id, &record.provider_id, &status])
            .inc();
        self.metrics
            .request_latency_ms
            .with_label_values(&[mode, &record.model_id, &record.provider_id])
            .observe(record.latency_ms as f64);
        self.metrics
            .cost_usd_total
            .with_label_values(&[&record.model_id, &record.provider_id])
            .inc_by(record.cost_usd.max(0.0));
        self.metrics
            .tokens_total
            .with_label_values(&[&record.model_id, &record.provider_id, "input"])
            .inc_by(record.usage.prompt_tokens);
        self.metrics
            .tokens_total
            .with_label_values(&[&record.model_id, &record.provider_id, "output"])
            .inc_by(record.usage.completion_tokens);

        let kind = if success {
            EventKind::RouteSuccess
        } else {
            EventKind::RouteError
        };
        self.bus.publish(
            Event::new(
                kind,
                serde_json::json!({
                    "model_id": record.model_id,
                    "provider_id": record.provider_id,
                    "mode": mode,
                    "status": record.status,
                    "latency_ms": record.latency_ms,
                    "cost_usd": record.cost_usd,
                    "error_class": record.error_class,
                }),
            )
            .with_request_id(record.request_id),
        );
    }

    /// Close the write queue and wait for the drain worker.
    pub async fn drain_writes(&self) {
        self.queue.close();
        let handle = self.queue_worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SUBSYSTEM_STOP_BUDGET, handle).await.is_err() {
                warn!("store write worker did not drain in time");
            }
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(list)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Assemble the full router with the middleware chain.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/chat", post(handlers::chat_completions))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/plan", post(handlers::plan))
        .route("/models", get(handlers::list_models))
        // Layer order: the last layer added is outermost.
        .layer(from_fn_with_state(state.clone(), key_ratelimit_mw))
        .layer(from_fn_with_state(state.clone(), budget_mw))
        .layer(from_fn(scope_mw))
        .layer(from_fn_with_state(state.clone(), auth_mw))
        .layer(from_fn_with_state(state.clone(), idempotency_mw))
        .layer(from_fn_with_state(state.clone(), ip_ratelimit_mw));

    Router::new()
        .nest("/v1", v1)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(from_fn(recover_mw))
        .layer(from_fn(access_log_mw))
        .layer(from_fn(request_id_mw))
        .with_state(state)
}

/// Handles to every background loop plus their stop signal.
pub struct BackgroundLoops {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundLoops {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if tokio::time::timeout(SUBSYSTEM_STOP_BUDGET, handle).await.is_err() {
                warn!("background loop did not stop in time");
            }
        }
    }
}

/// Spawn the long-running cooperative loops: prober, bandit refresher,
/// TSDB flush/prune, idempotency prune, limiter eviction, log prune,
/// rotation enforcement, pricing refresh, heartbeat.
pub async fn spawn_background(state: &AppState) -> BackgroundLoops {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let endpoints = state.engine.health_endpoints().await;
    handles.push(tokio::spawn(run_prober(
        state.engine.health().clone(),
        endpoints,
        PROBER_INTERVAL,
        stop_rx.clone(),
    )));

    handles.push(tokio::spawn(bandit::run_refresher(
        state.bandit.clone(),
        state.store.clone(),
        bandit::REFRESH_INTERVAL,
        stop_rx.clone(),
    )));

    handles.push(tokio::spawn(
        state.tsdb.clone().run_flush_loop(TSDB_FLUSH_INTERVAL, stop_rx.clone()),
    ));
    handles.push(tokio::spawn(
        state.idempotency.clone().run_prune_loop(stop_rx.clone()),
    ));
    handles.push(tokio::spawn(
        state.limiter.clone().run_eviction_loop(stop_rx.clone()),
    ));
    handles.push(tokio::spawn(pricing::run_refresher(
        state.engine.clone(),
        state.store.clone(),
        PRICING_INTERVAL,
        stop_rx.clone(),
    )));

    // TSDB retention.
    {
        let tsdb = state.tsdb.clone();
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TS_PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tsdb.prune().await {
                            warn!(error = %e, "time-series prune failed");
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        }));
    }

    // Request/reward log retention.
    {
        let store = state.store.clone();
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOG_PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS);
                        match store.prune_logs(cutoff).await {
                            Ok(0) => {}
                            Ok(pruned) => info!(pruned, "request/reward logs pruned"),
                            Err(e) => warn!(error = %e, "log prune failed"),
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        }));
    }

    // Key-rotation enforcement.
    {
        let keys = state.keys.clone();
        let bus = state.bus.clone();
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ROTATION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match keys.enforce_rotation(&bus).await {
                            Ok(0) => {}
                            Ok(disabled) => info!(disabled, "rotation enforcement disabled keys"),
                            Err(e) => warn!(error = %e, "rotation enforcement failed"),
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        }));
    }

    // Heartbeat plus the provider-health gauge sync.
    {
        let metrics = state.metrics.clone();
        let bus = state.bus.clone();
        let health = state.engine.health().clone();
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        metrics.heartbeat_total.inc();
                        metrics.provider_health_gauges(&health.snapshot());
                        bus.publish(Event::new(EventKind::Heartbeat, serde_json::json!({})));
                    }
                    _ = stop.changed() => return,
                }
            }
        }));
    }

    BackgroundLoops {
        stop: stop_tx,
        handles,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received");
}

/// Run the server to completion: bind, serve, drain, flush, close.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        SqliteStore::connect(&config.db_dsn)
            .await
            .context("store connection failed")?,
    );
    let state = AppState::build(config, store.clone()).await?;
    let loops = spawn_background(&state).await;
    let app = build_router(state.clone());

    let addr: SocketAddr = state
        .config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", state.config.listen_addr))?;
    info!(%addr, "🚀 TokenHub listening");

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = drained_tx.send(());
        });

    tokio::select! {
        result = server => result.context("server error")?,
        _ = async {
            let _ = drained_rx.await;
            tokio::time::sleep(HTTP_DRAIN_BUDGET).await;
        } => {
            warn!("HTTP drain budget elapsed, aborting in-flight requests");
        }
    }

    info!("stopping background loops");
    loops.shutdown().await;
    state.tsdb.flush().await;
    state.drain_writes().await;
    store.close().await;
    info!("✅ clean shutdown");
    Ok(())
}
