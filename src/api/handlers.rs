// HTTP handlers for the OpenAI-compatible surface
// POST /v1/chat (+ /chat/completions), POST /v1/plan, GET /v1/models,
// GET /healthz, GET /metrics.

use std::time::Instant;

use axum::body::boxed;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use hyper::Body;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{estimate_tokens, Decision, EventKind, RoutePolicy};
use crate::llm::{ChatRequest, TokenUsage};
use crate::models::{ApiKeyRecord, RouteMode, RoutingConfig};
use crate::server::{AppState, RequestRecord};

use super::middleware::{RequestId, HEADER_MODEL, HEADER_PROVIDER};
use super::types::{
    ApiError, ChatCompletionRequest, ModelListing, ModelsResponse, RoutingOptions,
};

fn build_policy(
    defaults: &RoutingConfig,
    routing: Option<&RoutingOptions>,
) -> Result<RoutePolicy, ApiError> {
    let mut policy = RoutePolicy::from_config(defaults);
    let Some(routing) = routing else {
        return Ok(policy);
    };
    if let Some(mode) = &routing.mode {
        policy.mode = RouteMode::parse(mode)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown routing mode {mode:?}")))?;
    }
    if let Some(budget) = routing.max_budget_usd {
        if budget < 0.0 || !budget.is_finite() {
            return Err(ApiError::BadRequest("max_budget_usd must be >= 0".into()));
        }
        policy.max_budget_usd = budget;
    }
    if let Some(latency) = routing.max_latency_ms {
        if latency == 0 {
            return Err(ApiError::BadRequest("max_latency_ms must be > 0".into()));
        }
        policy.max_latency_ms = latency;
    }
    if let Some(min_context) = routing.min_context_tokens {
        policy.min_context_tokens = min_context;
    }
    Ok(policy)
}

fn to_chat_request(request_id: &RequestId, body: &ChatCompletionRequest) -> ChatRequest {
    ChatRequest {
        id: Uuid::parse_str(&request_id.0).unwrap_or_else(|_| Uuid::new_v4()),
        model: String::new(),
        messages: body.messages.clone(),
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        top_p: body.top_p,
        stop: body.stop.clone(),
        user: body.user.clone(),
    }
}

fn routed_headers(response: &mut Response, decision: &Decision) {
    if let Ok(value) = HeaderValue::from_str(&decision.model_id) {
        response.headers_mut().insert(HEADER_MODEL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.provider_id) {
        response.headers_mut().insert(HEADER_PROVIDER, value);
    }
}

/// `POST /v1/chat` and `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(record): Extension<ApiKeyRecord>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let defaults = state.engine.defaults().await;
    let policy = build_policy(&defaults, body.routing.as_ref())?;
    let chat = to_chat_request(&request_id, &body);

    if body.stream {
        return stream_chat(state, record, request_id, body, chat, policy).await;
    }

    let started = Instant::now();
    match state
        .dispatcher
        .dispatch(&chat, body.model.as_deref(), &policy)
        .await
    {
        Ok(outcome) => {
            state
                .record_request(RequestRecord {
                    request_id: request_id.0.clone(),
                    api_key_id: Some(record.id.clone()),
                    model_id: outcome.decision.model_id.clone(),
                    provider_id: outcome.decision.provider_id.clone(),
                    mode: policy.mode,
                    policy: policy.clone(),
                    estimated_tokens: outcome.decision.estimated_tokens,
                    cost_usd: outcome.decision.estimated_cost_usd,
                    latency_ms: outcome.latency_ms,
                    status: 200,
                    error_class: None,
                    usage: outcome.response.usage,
                })
                .await;

            let mut response = Json(outcome.response.body).into_response();
            routed_headers(&mut response, &outcome.decision);
            Ok(response)
        }
        Err(err) => {
            let error_class = match &err {
                crate::engine::RouteError::NoCandidate(_) => "no_candidate".to_string(),
                crate::engine::RouteError::Provider(e) => e.class().to_string(),
            };
            let api_error = ApiError::from(err);
            state
                .record_request(RequestRecord {
                    request_id: request_id.0.clone(),
                    api_key_id: Some(record.id.clone()),
                    model_id: "none".into(),
                    provider_id: "none".into(),
                    mode: policy.mode,
                    policy: policy.clone(),
                    estimated_tokens: estimate_tokens(chat.content_bytes()),
                    cost_usd: 0.0,
                    latency_ms: started.elapsed().as_millis() as u64,
                    status: api_error.status().as_u16(),
                    error_class: Some(error_class),
                    usage: TokenUsage::default(),
                })
                .await;
            Err(api_error)
        }
    }
}

async fn stream_chat(
    state: AppState,
    record: ApiKeyRecord,
    request_id: RequestId,
    body: ChatCompletionRequest,
    chat: ChatRequest,
    policy: RoutePolicy,
) -> Result<Response, ApiError> {
    let (decision, mut stream) = state
        .engine
        .dispatch_stream(&chat, body.model.as_deref(), &policy)
        .await?;

    state.bus.publish(
        crate::engine::Event::new(
            EventKind::StreamStarted,
            serde_json::json!({
                "model_id": decision.model_id,
                "provider_id": decision.provider_id,
            }),
        )
        .with_request_id(request_id.0.clone()),
    );

    let (mut sender, response_body) = Body::channel();
    let task_state = state.clone();
    let task_decision = decision.clone();
    let task_policy = policy.clone();
    let estimated = decision.estimated_tokens;

    tokio::spawn(async move {
        let started = Instant::now();
        let mut error_class: Option<String> = None;

        while let Some(chunk_result) = stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    let Ok(json) = serde_json::to_string(&chunk) else {
                        continue;
                    };
                    // A failed send means the client went away; dropping the
                    // stream cancels the upstream read.
                    if sender
                        .send_data(format!("data: {json}\n\n").into())
                        .await
                        .is_err()
                    {
                        debug!(request_id = %request_id.0, "stream client disconnected");
                        error_class = Some("client_disconnect".into());
                        break;
                    }
                }
                Err(err) => {
                    warn!(request_id = %request_id.0, error = %err, "upstream stream error");
                    let _ = sender
                        .send_data(
                            format!(
                                "data: {{\"error\": {}, \"type\": \"stream_error\"}}\n\n",
                                serde_json::json!(err.to_string())
                            )
                            .into(),
                        )
                        .await;
                    error_class = Some(err.class().to_string());
                    break;
                }
            }
        }
        let _ = sender.send_data("data: [DONE]\n\n".into()).await;

        // One logical log entry per stream, recorded at close.
        let success = error_class.is_none();
        task_state
            .record_request(RequestRecord {
                request_id: request_id.0.clone(),
                api_key_id: Some(record.id.clone()),
                model_id: task_decision.model_id.clone(),
                provider_id: task_decision.provider_id.clone(),
                mode: task_policy.mode,
                policy: task_policy.clone(),
                estimated_tokens: estimated,
                cost_usd: task_decision.estimated_cost_usd,
                latency_ms: started.elapsed().as_millis() as u64,
                status: if success { 200 } else { 502 },
                error_class,
                usage: TokenUsage {
                    prompt_tokens: estimated,
                    completion_tokens: 0,
                    total_tokens: estimated,
                },
            })
            .await;
    });

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(boxed(response_body))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    routed_headers(&mut response, &decision);
    Ok(response)
}

/// `POST /v1/plan`: run selection and return the decision without
/// dispatching. Scope `plan`.
pub async fn plan(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Json<Decision>, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let defaults = state.engine.defaults().await;
    let policy = build_policy(&defaults, body.routing.as_ref())?;
    let chat = to_chat_request(&request_id, &body);
    let estimated = estimate_tokens(chat.content_bytes());
    let expected_output = body.max_tokens.map(u64::from).unwrap_or(500);

    let decision = state
        .engine
        .select(estimated, expected_output, body.model.as_deref(), &policy)
        .await?;
    Ok(Json(decision))
}

/// `GET /v1/models`: enabled models in the OpenAI listing shape.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let mut data: Vec<ModelListing> = state
        .engine
        .models()
        .await
        .into_iter()
        .filter(|m| m.enabled)
        .map(|m| ModelListing {
            id: m.id,
            object: "model",
            owned_by: m.provider_id,
            context_window: m.max_context_tokens,
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

/// `GET /healthz`: 200 when at least one enabled model has a routable
/// provider, 503 otherwise.
pub async fn healthz(State(state): State<AppState>) -> Response {
    let adapters = state.engine.adapter_count().await;
    let models = state.engine.enabled_model_count().await;
    let routable = state.engine.has_routable_model().await;

    let status = if routable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if routable { "ok" } else { "unavailable" },
        "adapters": adapters,
        "models": models,
    });
    (status, Json(body)).into_response()
}

/// `GET /metrics`: Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .provider_health_gauges(&state.engine.health().snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
