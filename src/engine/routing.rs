// Routing engine for TokenHub
// Candidate filtering, multi-mode scoring, Thompson-sampling exploration,
// and the retry/escalation orchestration around provider dispatch.

//! # Routing Engine
//!
//! Selects one concrete (model, provider) pair per request:
//!
//! ```text
//! token estimate -> hard override? -> filter -> score by mode
//!     -> bandit bonus (normal) -> argmax -> Decision
//! ```
//!
//! Dispatch wraps selection with the retry discipline: transient and
//! rate-limited errors remove the failed pair from the candidate set and
//! re-select (no backoff; a fresh model avoids the hot provider), context
//! overflows escalate to a larger-context successor, fatal errors surface
//! immediately. At most three attempts and two escalations per request,
//! bounded by the policy's wall-clock latency budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::llm::traits::ProviderAdapter;
use crate::llm::{ChatRequest, ProviderError, ProviderResponse};
use crate::models::{HealthLevel, Model, Provider, RouteMode, RoutingConfig};

use super::bandit::BanditPolicy;
use super::events::{Event, EventBus, EventKind};
use super::health::HealthTracker;

/// Bytes-per-token approximation for the input estimate.
const BYTES_PER_TOKEN: u64 = 4;
/// Output-token guess used for cost estimates when the caller sets no cap.
const DEFAULT_OUTPUT_TOKENS: u64 = 500;

const MAX_ATTEMPTS: u32 = 3;
const MAX_ESCALATIONS: u32 = 2;

/// Approximate input tokens from message bytes.
pub fn estimate_tokens(content_bytes: usize) -> u64 {
    (content_bytes as u64 / BYTES_PER_TOKEN).max(1)
}

/// Categorical context feature for the bandit.
pub fn token_bucket(tokens: u64) -> &'static str {
    match tokens {
        t if t < 256 => "xs",
        t if t < 2_000 => "s",
        t if t < 16_000 => "m",
        t if t < 64_000 => "l",
        _ => "xl",
    }
}

/// Per-request routing policy, snapshotted from the defaults at admission.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub mode: RouteMode,
    /// 0 means no budget ceiling.
    pub max_budget_usd: f64,
    pub max_latency_ms: u64,
    pub min_context_tokens: u32,
}

impl RoutePolicy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            mode: config.default_mode,
            max_budget_usd: config.default_max_budget_usd,
            max_latency_ms: config.default_max_latency_ms,
            min_context_tokens: 0,
        }
    }
}

/// The routing verdict for one request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Decision {
    pub model_id: String,
    pub provider_id: String,
    pub estimated_cost_usd: f64,
    pub estimated_tokens: u64,
    pub mode: RouteMode,
    /// Machine-parseable, e.g. `mode=normal;score=7.42;bandit=+0.31;cost=0.0012;lat=812`.
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no candidate model satisfied the routing policy: {0}")]
    NoCandidate(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A completed dispatch with its accounting.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub decision: Decision,
    pub response: ProviderResponse,
    pub latency_ms: u64,
    pub attempts: u32,
    pub escalations: u32,
}

struct SelectInput<'a> {
    estimated_tokens: u64,
    expected_output_tokens: u64,
    override_model: Option<&'a str>,
    policy: &'a RoutePolicy,
    min_context_tokens: u32,
    exclude: &'a [(String, String)],
}

pub struct RoutingEngine {
    models: RwLock<HashMap<String, Model>>,
    providers: RwLock<HashMap<String, Provider>>,
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    defaults: RwLock<RoutingConfig>,
    health: Arc<HealthTracker>,
    bandit: Arc<BanditPolicy>,
    bus: Arc<EventBus>,
}

impl RoutingEngine {
    pub fn new(
        defaults: RoutingConfig,
        health: Arc<HealthTracker>,
        bandit: Arc<BanditPolicy>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            defaults: RwLock::new(defaults),
            health,
            bandit,
            bus,
        }
    }

    // -- table maintenance (admin operations, infrequent) --------------------

    pub async fn register_provider(&self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .await
            .insert(provider.id.clone(), adapter);
        self.providers
            .write()
            .await
            .insert(provider.id.clone(), provider);
    }

    pub async fn upsert_model(&self, model: Model) {
        self.models.write().await.insert(model.id.clone(), model);
    }

    pub async fn model(&self, id: &str) -> Option<Model> {
        self.models.read().await.get(id).cloned()
    }

    pub async fn models(&self) -> Vec<Model> {
        self.models.read().await.values().cloned().collect()
    }

    pub async fn adapter(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.read().await.get(provider_id).cloned()
    }

    pub async fn adapter_count(&self) -> usize {
        self.adapters.read().await.len()
    }

    pub async fn enabled_model_count(&self) -> usize {
        self.models.read().await.values().filter(|m| m.enabled).count()
    }

    /// (provider id, URL) pairs for the health prober.
    pub async fn health_endpoints(&self) -> Vec<(String, String)> {
        self.adapters
            .read()
            .await
            .iter()
            .filter_map(|(id, adapter)| adapter.health_endpoint().map(|url| (id.clone(), url)))
            .collect()
    }

    /// Whether at least one enabled model has a non-down provider.
    pub async fn has_routable_model(&self) -> bool {
        let models = self.models.read().await;
        models
            .values()
            .any(|m| m.enabled && self.health.level(&m.provider_id) != HealthLevel::Down)
    }

    pub async fn defaults(&self) -> RoutingConfig {
        self.defaults.read().await.clone()
    }

    /// Atomically replace the routing defaults; in-flight requests keep
    /// their snapshot.
    pub async fn update_defaults(&self, config: RoutingConfig) {
        *self.defaults.write().await = config;
        info!("routing defaults updated");
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    // -- selection -----------------------------------------------------------

    /// Select a candidate for a request without dispatching it.
    pub async fn select(
        &self,
        estimated_tokens: u64,
        expected_output_tokens: u64,
        override_model: Option<&str>,
        policy: &RoutePolicy,
    ) -> Result<Decision, RouteError> {
        self.select_inner(&SelectInput {
            estimated_tokens,
            expected_output_tokens,
            override_model,
            policy,
            min_context_tokens: policy.min_context_tokens,
            exclude: &[],
        })
        .await
    }

    async fn select_inner(&self, input: &SelectInput<'_>) -> Result<Decision, RouteError> {
        let models = self.models.read().await;
        let providers = self.providers.read().await;
        let provider_enabled = |provider_id: &str| {
            providers.get(provider_id).map_or(true, |p| p.enabled)
        };
        let bucket = token_bucket(input.estimated_tokens);

        // Hard override short-circuits filtering: honored when the model is
        // enabled and its provider is not down, refused otherwise.
        if let Some(wanted) = input.override_model {
            let model = models
                .get(wanted)
                .filter(|m| m.enabled && provider_enabled(&m.provider_id))
                .ok_or_else(|| RouteError::NoCandidate(format!("model {wanted:?} unavailable")))?;
            if self.health.level(&model.provider_id) == HealthLevel::Down {
                return Err(RouteError::NoCandidate(format!(
                    "model {wanted:?} provider {} is down",
                    model.provider_id
                )));
            }
            let cost = model.estimate_cost(input.estimated_tokens, input.expected_output_tokens);
            return Ok(Decision {
                model_id: model.id.clone(),
                provider_id: model.provider_id.clone(),
                estimated_cost_usd: cost,
                estimated_tokens: input.estimated_tokens,
                mode: input.policy.mode,
                reason: format!(
                    "mode={};override=true;cost={:.4};lat={:.0}",
                    input.policy.mode,
                    cost,
                    self.health.avg_latency_ms(&model.provider_id)
                ),
            });
        }

        let policy = input.policy;
        let mut best: Option<(f64, f64, &Model, f64, f64)> = None; // score, bandit, model, cost, latency

        for model in models.values() {
            if !model.enabled || !provider_enabled(&model.provider_id) {
                continue;
            }
            if input
                .exclude
                .iter()
                .any(|(m, p)| *m == model.id && *p == model.provider_id)
            {
                continue;
            }
            if self.health.level(&model.provider_id) == HealthLevel::Down {
                continue;
            }
            if model.max_context_tokens < input.min_context_tokens {
                continue;
            }
            if (model.max_context_tokens as u64) < input.estimated_tokens * 2 {
                continue;
            }
            let cost = model.estimate_cost(input.estimated_tokens, input.expected_output_tokens);
            if policy.max_budget_usd > 0.0 && cost > policy.max_budget_usd {
                continue;
            }
            let latency = self.health.avg_latency_ms(&model.provider_id);
            if latency > policy.max_latency_ms as f64 {
                continue;
            }

            let mut bandit_bonus = 0.0;
            let score = match policy.mode {
                RouteMode::Cheap => -cost,
                RouteMode::Fast => -latency,
                RouteMode::Large => model.max_context_tokens as f64,
                RouteMode::Budget => {
                    let mut score = 0.0;
                    if policy.max_budget_usd > 0.0 {
                        score -= cost / policy.max_budget_usd;
                    }
                    score -= 0.1 * (latency / policy.max_latency_ms as f64);
                    score
                }
                RouteMode::Normal => {
                    bandit_bonus = self.bandit.bonus(&model.id, bucket);
                    let cost_norm = if policy.max_budget_usd > 0.0 {
                        cost / policy.max_budget_usd
                    } else {
                        cost
                    };
                    let latency_norm = if policy.max_latency_ms > 0 {
                        latency / policy.max_latency_ms as f64
                    } else {
                        latency
                    };
                    model.weight as f64 + bandit_bonus - 0.1 * cost_norm - 0.05 * latency_norm
                }
            };

            let better = match &best {
                None => true,
                Some((best_score, _, best_model, _, _)) => {
                    // Ties break by higher weight, then lexicographically
                    // smaller model id, so selection is deterministic.
                    score > *best_score
                        || (score == *best_score
                            && (model.weight > best_model.weight
                                || (model.weight == best_model.weight
                                    && model.id < best_model.id)))
                }
            };
            if better {
                best = Some((score, bandit_bonus, model, cost, latency));
            }
        }

        match best {
            Some((score, bandit_bonus, model, cost, latency)) => Ok(Decision {
                model_id: model.id.clone(),
                provider_id: model.provider_id.clone(),
                estimated_cost_usd: cost,
                estimated_tokens: input.estimated_tokens,
                mode: policy.mode,
                reason: format!(
                    "mode={};score={:.2};bandit={:+.2};cost={:.4};lat={:.0}",
                    policy.mode, score, bandit_bonus, cost, latency
                ),
            }),
            None => Err(RouteError::NoCandidate(format!(
                "mode={} est_tokens={} min_context={} budget={} latency={}ms excluded={}",
                policy.mode,
                input.estimated_tokens,
                input.min_context_tokens,
                policy.max_budget_usd,
                policy.max_latency_ms,
                input.exclude.len()
            ))),
        }
    }

    // -- dispatch ------------------------------------------------------------

    /// Select and send, with retry, escalation and wall-clock bounding.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        override_model: Option<&str>,
        policy: &RoutePolicy,
    ) -> Result<DispatchOutcome, RouteError> {
        let started = Instant::now();
        let wall_budget = Duration::from_millis(policy.max_latency_ms.max(1));
        let estimated_tokens = estimate_tokens(request.content_bytes());
        let expected_output = request.max_tokens.map(u64::from).unwrap_or(DEFAULT_OUTPUT_TOKENS);

        let mut exclude: Vec<(String, String)> = Vec::new();
        let mut min_context = policy.min_context_tokens;
        let mut current_override = override_model;
        let mut attempts = 0u32;
        let mut escalations = 0u32;
        let mut last_error: Option<ProviderError> = None;

        loop {
            if attempts > 0 && started.elapsed() >= wall_budget {
                warn!(request_id = %request.id, attempts, "latency budget exhausted");
                return Err(match last_error {
                    Some(err) => RouteError::Provider(err),
                    None => RouteError::NoCandidate("latency budget exhausted".into()),
                });
            }

            let decision = self
                .select_inner(&SelectInput {
                    estimated_tokens,
                    expected_output_tokens: expected_output,
                    override_model: current_override,
                    policy,
                    min_context_tokens: min_context,
                    exclude: &exclude,
                })
                .await
                .map_err(|select_err| match last_error.take() {
                    // Candidates ran out mid-retry; the classified upstream
                    // error is more useful than NoCandidate.
                    Some(err) => RouteError::Provider(err),
                    None => select_err,
                })?;

            let adapter = match self.adapter(&decision.provider_id).await {
                Some(adapter) => adapter,
                None => {
                    return Err(RouteError::NoCandidate(format!(
                        "no adapter registered for provider {:?}",
                        decision.provider_id
                    )))
                }
            };

            attempts += 1;
            let mut attempt_request = request.clone();
            attempt_request.model = decision.model_id.clone();

            debug!(
                request_id = %request.id,
                model = %decision.model_id,
                provider = %decision.provider_id,
                attempt = attempts,
                reason = %decision.reason,
                "dispatching"
            );

            let call_started = Instant::now();
            match adapter.send(&attempt_request).await {
                Ok(response) => {
                    let latency_ms = call_started.elapsed().as_millis() as u64;
                    self.health.record_success(&decision.provider_id, latency_ms);
                    return Ok(DispatchOutcome {
                        decision,
                        response,
                        latency_ms,
                        attempts,
                        escalations,
                    });
                }
                Err(err) => {
                    let cooldown = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            Some(retry_after.unwrap_or(Duration::from_secs(30)))
                        }
                        _ => None,
                    };
                    self.health
                        .record_failure(&decision.provider_id, &err.to_string(), cooldown);

                    warn!(
                        request_id = %request.id,
                        model = %decision.model_id,
                        provider = %decision.provider_id,
                        class = err.class(),
                        error = %err,
                        "upstream call failed"
                    );

                    exclude.push((decision.model_id.clone(), decision.provider_id.clone()));
                    current_override = None;

                    match &err {
                        ProviderError::ContextOverflow(_) if escalations < MAX_ESCALATIONS => {
                            escalations += 1;
                            // A successor must fit at least double the
                            // estimated need.
                            min_context =
                                min_context.max((estimated_tokens * 2).min(u32::MAX as u64) as u32);
                            self.bus.publish(
                                Event::new(
                                    EventKind::Escalation,
                                    serde_json::json!({
                                        "from_model": decision.model_id,
                                        "needed_tokens": estimated_tokens,
                                        "min_context": min_context,
                                        "escalation": escalations,
                                    }),
                                )
                                .with_request_id(request.id.to_string()),
                            );
                            last_error = Some(err);
                        }
                        ProviderError::RateLimited { .. } | ProviderError::Transient(_)
                            if attempts < MAX_ATTEMPTS =>
                        {
                            last_error = Some(err);
                        }
                        _ => return Err(RouteError::Provider(err)),
                    }
                }
            }
        }
    }

    /// Select once and open an upstream stream; streaming requests do not
    /// retry mid-stream.
    pub async fn dispatch_stream(
        &self,
        request: &ChatRequest,
        override_model: Option<&str>,
        policy: &RoutePolicy,
    ) -> Result<(Decision, crate::llm::ChunkStream), RouteError> {
        let estimated_tokens = estimate_tokens(request.content_bytes());
        let expected_output = request.max_tokens.map(u64::from).unwrap_or(DEFAULT_OUTPUT_TOKENS);
        let decision = self
            .select(estimated_tokens, expected_output, override_model, policy)
            .await?;

        let adapter = self
            .adapter(&decision.provider_id)
            .await
            .ok_or_else(|| {
                RouteError::NoCandidate(format!(
                    "no adapter registered for provider {:?}",
                    decision.provider_id
                ))
            })?;

        let mut upstream_request = request.clone();
        upstream_request.model = decision.model_id.clone();

        match adapter.send_stream(upstream_request).await {
            Ok(stream) => Ok((decision, stream)),
            Err(err) => {
                let cooldown = match &err {
                    ProviderError::RateLimited { retry_after, .. } => {
                        Some(retry_after.unwrap_or(Duration::from_secs(30)))
                    }
                    _ => None,
                };
                self.health
                    .record_failure(&decision.provider_id, &err.to_string(), cooldown);
                Err(RouteError::Provider(err))
            }
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    //! Stub adapter shared by engine- and server-level tests.

    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::StreamExt;

    use crate::llm::traits::ProviderAdapter;
    use crate::llm::{
        ChatRequest, ChunkStream, ProviderError, ProviderResponse, ProviderResult,
        StreamingChoice, StreamingChunk, StreamingDelta, TokenUsage,
    };
    use crate::models::ProviderKind;

    /// Always succeeds; streams two chunks then a finish marker.
    pub struct MockOkAdapter {
        id: String,
    }

    impl MockOkAdapter {
        pub fn new(id: &str) -> Self {
            Self { id: id.into() }
        }

        pub fn arc(id: &str) -> Arc<dyn ProviderAdapter> {
            Arc::new(Self::new(id))
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockOkAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::Openai
        }
        async fn send(&self, request: &ChatRequest) -> ProviderResult<ProviderResponse> {
            Ok(ProviderResponse {
                body: serde_json::json!({
                    "id": request.id.to_string(),
                    "object": "chat.completion",
                    "model": request.model,
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"},
                                 "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
                }),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
        async fn send_stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream> {
            let chunk = |content: Option<&str>, finish: Option<&str>| StreamingChunk {
                id: request.id.to_string(),
                object: "chat.completion.chunk".into(),
                created: 0,
                model: request.model.clone(),
                choices: vec![StreamingChoice {
                    index: 0,
                    delta: StreamingDelta {
                        role: Some("assistant".into()),
                        content: content.map(String::from),
                    },
                    finish_reason: finish.map(String::from),
                }],
            };
            let chunks = vec![
                Ok(chunk(Some("hello"), None)),
                Ok(chunk(Some(" world"), None)),
                Ok(chunk(None, Some("stop"))),
            ];
            Ok(Box::new(futures::stream::iter(chunks).boxed()))
        }
        fn classify_error(&self, status: u16, body: &str) -> ProviderError {
            crate::llm::classify_http_error(status, body, None)
        }
        fn health_endpoint(&self) -> Option<String> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, MessageRole, ProviderResult, TokenUsage};
    use crate::models::{PricingSource, ProviderKind};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn engine() -> RoutingEngine {
        let bus = Arc::new(EventBus::new());
        RoutingEngine::new(
            RoutingConfig::default(),
            Arc::new(HealthTracker::new(bus.clone())),
            Arc::new(BanditPolicy::new(0.0)),
            bus,
        )
    }

    fn model(id: &str, provider: &str, weight: i64, context: u32, input_per_1k: f64) -> Model {
        Model {
            id: id.into(),
            provider_id: provider.into(),
            weight,
            max_context_tokens: context,
            input_per_1k,
            output_per_1k: input_per_1k * 2.0,
            enabled: true,
            pricing_source: PricingSource::Manual,
        }
    }

    fn provider(id: &str) -> Provider {
        Provider {
            id: id.into(),
            kind: ProviderKind::Openai,
            base_url: "http://localhost".into(),
            enabled: true,
            credential_source: crate::models::CredentialSource::None,
        }
    }

    fn policy(mode: RouteMode) -> RoutePolicy {
        RoutePolicy {
            mode,
            max_budget_usd: 0.0,
            max_latency_ms: 30_000,
            min_context_tokens: 0,
        }
    }

    /// Scripted adapter: pops one outcome per send.
    struct MockAdapter {
        id: String,
        outcomes: Mutex<VecDeque<ProviderResult<ProviderResponse>>>,
    }

    impl MockAdapter {
        fn new(id: &str, outcomes: Vec<ProviderResult<ProviderResponse>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                outcomes: Mutex::new(outcomes.into()),
            })
        }

        fn ok() -> ProviderResult<ProviderResponse> {
            Ok(ProviderResponse {
                body: serde_json::json!({"ok": true}),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::Openai
        }
        async fn send(&self, _request: &ChatRequest) -> ProviderResult<ProviderResponse> {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(MockAdapter::ok)
        }
        async fn send_stream(
            &self,
            _request: ChatRequest,
        ) -> ProviderResult<crate::llm::ChunkStream> {
            Err(ProviderError::Fatal("no stream in mock".into()))
        }
        fn classify_error(&self, status: u16, body: &str) -> ProviderError {
            crate::llm::classify_http_error(status, body, None)
        }
        fn health_endpoint(&self) -> Option<String> {
            None
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            id: uuid::Uuid::new_v4(),
            model: String::new(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: "hello there".into(),
                name: None,
            }],
            temperature: None,
            max_tokens: Some(100),
            top_p: None,
            stop: None,
            user: None,
        }
    }

    #[tokio::test]
    async fn empty_table_yields_no_candidate() {
        let engine = engine();
        let err = engine.select(100, 100, None, &policy(RouteMode::Normal)).await;
        assert!(matches!(err, Err(RouteError::NoCandidate(_))));
    }

    #[tokio::test]
    async fn cheap_mode_picks_lowest_cost() {
        let engine = engine();
        engine.upsert_model(model("pricey", "p1", 10, 8192, 0.03)).await;
        engine.upsert_model(model("bargain", "p1", 1, 8192, 0.001)).await;

        let decision = engine
            .select(100, 100, None, &policy(RouteMode::Cheap))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "bargain");
    }

    #[tokio::test]
    async fn large_mode_picks_biggest_context() {
        let engine = engine();
        engine.upsert_model(model("small", "p1", 10, 8_192, 0.001)).await;
        engine.upsert_model(model("big", "p1", 1, 200_000, 0.01)).await;

        let decision = engine
            .select(100, 100, None, &policy(RouteMode::Large))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "big");
    }

    #[tokio::test]
    async fn normal_mode_ties_break_on_weight_then_id() {
        let engine = engine();
        engine.upsert_model(model("b-model", "p1", 5, 8192, 0.0)).await;
        engine.upsert_model(model("a-model", "p1", 5, 8192, 0.0)).await;

        let decision = engine
            .select(100, 100, None, &policy(RouteMode::Normal))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "a-model");
    }

    #[tokio::test]
    async fn filter_removes_disabled_and_small_context() {
        let engine = engine();
        let mut disabled = model("disabled", "p1", 10, 200_000, 0.001);
        disabled.enabled = false;
        engine.upsert_model(disabled).await;
        engine.upsert_model(model("tiny", "p1", 10, 4_096, 0.001)).await;
        engine.upsert_model(model("big", "p1", 1, 200_000, 0.001)).await;

        // 10k estimated tokens: tiny fails the estimated*2 rule.
        let mut p = policy(RouteMode::Normal);
        p.min_context_tokens = 8_000;
        let decision = engine.select(10_000, 100, None, &p).await.unwrap();
        assert_eq!(decision.model_id, "big");
    }

    #[tokio::test]
    async fn budget_ceiling_excludes_expensive_models() {
        let engine = engine();
        engine.upsert_model(model("pricey", "p1", 10, 8192, 10.0)).await;

        let mut p = policy(RouteMode::Normal);
        p.max_budget_usd = 0.01;
        let err = engine.select(1000, 100, None, &p).await;
        assert!(matches!(err, Err(RouteError::NoCandidate(_))));
    }

    #[tokio::test]
    async fn down_provider_is_not_a_candidate() {
        let engine = engine();
        engine.upsert_model(model("m", "p1", 1, 8192, 0.001)).await;
        for _ in 0..10 {
            engine.health().record_failure("p1", "boom", None);
        }
        let err = engine.select(100, 100, None, &policy(RouteMode::Normal)).await;
        assert!(matches!(err, Err(RouteError::NoCandidate(_))));
    }

    #[tokio::test]
    async fn hard_override_wins_when_available() {
        let engine = engine();
        engine.upsert_model(model("wanted", "p1", 0, 8192, 0.5)).await;
        engine.upsert_model(model("better", "p1", 99, 8192, 0.0)).await;

        let decision = engine
            .select(100, 100, Some("wanted"), &policy(RouteMode::Normal))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "wanted");
        assert!(decision.reason.contains("override=true"));
    }

    #[tokio::test]
    async fn hard_override_fails_when_unknown() {
        let engine = engine();
        let err = engine
            .select(100, 100, Some("ghost"), &policy(RouteMode::Normal))
            .await;
        assert!(matches!(err, Err(RouteError::NoCandidate(_))));
    }

    #[tokio::test]
    async fn transient_error_retries_on_excluded_candidate_set() {
        let engine = engine();
        engine.upsert_model(model("flaky", "p1", 10, 8192, 0.001)).await;
        engine.upsert_model(model("steady", "p2", 1, 8192, 0.001)).await;
        engine
            .register_provider(
                provider("p1"),
                MockAdapter::new("p1", vec![Err(ProviderError::Transient("boom".into()))]),
            )
            .await;
        engine
            .register_provider(provider("p2"), MockAdapter::new("p2", vec![MockAdapter::ok()]))
            .await;

        let outcome = engine
            .dispatch(&request(), None, &policy(RouteMode::Normal))
            .await
            .unwrap();
        assert_eq!(outcome.decision.model_id, "steady");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn attempts_cap_surfaces_last_error() {
        let engine = engine();
        for (id, weight) in [("m1", 3), ("m2", 2), ("m3", 1), ("m4", 0)] {
            engine.upsert_model(model(id, &format!("p-{id}"), weight, 8192, 0.001)).await;
            engine
                .register_provider(
                    provider(&format!("p-{id}")),
                    MockAdapter::new(
                        &format!("p-{id}"),
                        vec![Err(ProviderError::Transient(format!("{id} down")))],
                    ),
                )
                .await;
        }

        let err = engine
            .dispatch(&request(), None, &policy(RouteMode::Normal))
            .await
            .unwrap_err();
        match err {
            RouteError::Provider(ProviderError::Transient(msg)) => {
                assert!(msg.contains("m3 down"), "got {msg:?}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_overflow_escalates_to_larger_model() {
        let engine = engine();
        engine.upsert_model(model("small", "p1", 10, 8192, 0.001)).await;
        engine.upsert_model(model("large", "p2", 0, 200_000, 0.01)).await;
        engine
            .register_provider(
                provider("p1"),
                MockAdapter::new(
                    "p1",
                    vec![Err(ProviderError::ContextOverflow("too long".into()))],
                ),
            )
            .await;
        engine
            .register_provider(provider("p2"), MockAdapter::new("p2", vec![MockAdapter::ok()]))
            .await;

        let outcome = engine
            .dispatch(&request(), None, &policy(RouteMode::Normal))
            .await
            .unwrap();
        assert_eq!(outcome.decision.model_id, "large");
        assert_eq!(outcome.escalations, 1);
    }

    #[tokio::test]
    async fn fatal_error_surfaces_immediately() {
        let engine = engine();
        engine.upsert_model(model("m1", "p1", 10, 8192, 0.001)).await;
        engine.upsert_model(model("m2", "p2", 1, 8192, 0.001)).await;
        engine
            .register_provider(
                provider("p1"),
                MockAdapter::new("p1", vec![Err(ProviderError::Fatal("bad request".into()))]),
            )
            .await;
        engine
            .register_provider(provider("p2"), MockAdapter::new("p2", vec![]))
            .await;

        let err = engine
            .dispatch(&request(), None, &policy(RouteMode::Normal))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Provider(ProviderError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn defaults_hot_reload_is_atomic_per_snapshot() {
        let engine = engine();
        engine.upsert_model(model("pricey", "p1", 10, 8192, 0.03)).await;
        engine.upsert_model(model("bargain", "p1", 1, 8192, 0.001)).await;

        // A policy snapshotted before the reload keeps its mode.
        let old_policy = RoutePolicy::from_config(&engine.defaults().await);
        assert_eq!(old_policy.mode, RouteMode::Normal);

        engine
            .update_defaults(RoutingConfig {
                default_mode: RouteMode::Cheap,
                default_max_budget_usd: 1.0,
                default_max_latency_ms: 5_000,
            })
            .await;

        let new_policy = RoutePolicy::from_config(&engine.defaults().await);
        assert_eq!(new_policy.mode, RouteMode::Cheap);
        let decision = engine.select(100, 100, None, &new_policy).await.unwrap();
        assert_eq!(decision.model_id, "bargain");

        // The old snapshot still routes by weight.
        let decision = engine.select(100, 100, None, &old_policy).await.unwrap();
        assert_eq!(decision.model_id, "pricey");
    }

    #[tokio::test]
    async fn reason_string_is_machine_parseable() {
        let engine = engine();
        engine.upsert_model(model("m1", "p1", 2, 8192, 0.001)).await;

        let decision = engine
            .select(100, 100, None, &policy(RouteMode::Normal))
            .await
            .unwrap();
        let fields: std::collections::HashMap<&str, &str> = decision
            .reason
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        assert_eq!(fields.get("mode"), Some(&"normal"));
        assert!(fields.contains_key("score"));
        assert!(fields.contains_key("bandit"));
        assert!(fields.contains_key("cost"));
        assert!(fields.contains_key("lat"));
    }

    #[test]
    fn token_buckets_cover_size_boundaries() {
        assert_eq!(token_bucket(1), "xs");
        assert_eq!(token_bucket(255), "xs");
        assert_eq!(token_bucket(256), "s");
        assert_eq!(token_bucket(1_999), "s");
        assert_eq!(token_bucket(2_000), "m");
        assert_eq!(token_bucket(15_999), "m");
        assert_eq!(token_bucket(16_000), "l");
        assert_eq!(token_bucket(63_999), "l");
        assert_eq!(token_bucket(64_000), "xl");
    }

    #[test]
    fn token_estimate_divides_bytes_by_four() {
        assert_eq!(estimate_tokens(0), 1);
        assert_eq!(estimate_tokens(400), 100);
    }
}
