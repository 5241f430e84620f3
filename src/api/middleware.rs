// Ingress middleware chain
// Outermost first: request id, access log, panic recovery, CORS, per-IP
// rate limit, idempotency replay, bearer auth, scope check, budget check,
// per-key rate limit. Handlers run inside the whole stack.

use axum::body::{boxed, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::ApiKeyRecord;
use crate::server::AppState;

use super::types::ApiError;

/// Request id assigned at the outermost layer; everything downstream reads
/// it from extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const HEADER_IDEMPOTENT_REPLAY: &str = "idempotency-replay";
pub const HEADER_MODEL: &str = "x-tokenhub-model";
pub const HEADER_PROVIDER: &str = "x-tokenhub-provider";

/// Assign a request id and echo it on the response.
pub async fn request_id_mw(mut req: Request<Body>, next: Next<Body>) -> Response {
    let id = req
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

/// Structured access log.
pub async fn access_log_mw(req: Request<Body>, next: Next<Body>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let started = Instant::now();
    let response = next.run(req).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        request_id,
        "request"
    );
    response
}

/// Convert handler panics into a 500 carrying the request id.
pub async fn recover_mw(req: Request<Body>, next: Next<Body>) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".into());
            error!(request_id, message, "handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({
                    "error": {"message": "internal server error", "type": "internal_error"},
                    "request_id": request_id,
                })),
            )
                .into_response()
        }
    }
}

/// Global per-IP token bucket on `/v1/*`.
pub async fn ip_ratelimit_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".into());

    if !state.limiter.allow(&format!("ip:{ip}")) {
        return ApiError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Replay cached responses for duplicated `Idempotency-Key`s; buffer and
/// cache new ones. Event streams pass through untouched.
pub async fn idempotency_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    let Some(idempotency_key) = req
        .headers()
        .get(HEADER_IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(req).await;
    };

    // Replay is scoped per caller: the auth header is part of the cache key
    // even though authentication happens further in.
    let auth = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let cache_key = format!("{auth}\u{0}{idempotency_key}");

    if let Some(cached) = state.idempotency.get(&cache_key) {
        let mut builder = Response::builder()
            .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
        for (name, value) in &cached.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header(HEADER_IDEMPOTENT_REPLAY, "true");
        return builder
            .body(boxed(Body::from(cached.body.clone())))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let response = next.run(req).await;

    let is_stream = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);
    if is_stream {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let keep = [
        axum::http::header::CONTENT_TYPE.as_str(),
        HEADER_MODEL,
        HEADER_PROVIDER,
    ];
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter(|(name, _)| keep.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    state
        .idempotency
        .set(&cache_key, bytes.clone(), parts.status.as_u16(), headers);

    Response::from_parts(parts, boxed(Body::from(bytes)))
}

/// Bearer-token authentication; inserts the validated record into request
/// extensions.
pub async fn auth_mw(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next<Body>,
) -> Response {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .map(str::to_string);

    let Some(token) = token else {
        return ApiError::Unauthorized("missing api key".into()).into_response();
    };

    match state.keys.validate(&token).await {
        Ok(record) => {
            req.extensions_mut().insert(record);
            next.run(req).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn required_scope(path: &str) -> Option<&'static str> {
    if path.contains("/plan") {
        Some("plan")
    } else if path.contains("/chat") {
        Some("chat")
    } else {
        None
    }
}

/// Endpoint scope enforcement over the validated key's scopes.
pub async fn scope_mw(req: Request<Body>, next: Next<Body>) -> Response {
    let Some(scope) = required_scope(req.uri().path()) else {
        return next.run(req).await;
    };
    match req.extensions().get::<ApiKeyRecord>() {
        Some(record) if record.allows_scope(scope) => next.run(req).await,
        Some(_) => ApiError::Forbidden("insufficient scope".into()).into_response(),
        None => ApiError::Unauthorized("missing api key".into()).into_response(),
    }
}

/// Always-fresh monthly budget gate.
pub async fn budget_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if let Some(record) = req.extensions().get::<ApiKeyRecord>().cloned() {
        if let Err(err) = state.budget.check(&record).await {
            return ApiError::from(err).into_response();
        }
    }
    next.run(req).await
}

/// Per-API-key token bucket honoring the record's RPS override.
pub async fn key_ratelimit_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if let Some(record) = req.extensions().get::<ApiKeyRecord>() {
        let rate = match record.rps_override {
            0 => Some(state.config.rate_limit_rps),
            n if n > 0 => Some(n as u32),
            // -1 (or anything negative) means unlimited.
            _ => None,
        };
        if let Some(rate) = rate {
            let key = format!("apikey:{}", record.id);
            if !state.limiter.allow_custom(&key, rate, rate.saturating_mul(2)) {
                return ApiError::RateLimited.into_response();
            }
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_map_matches_endpoints() {
        assert_eq!(required_scope("/v1/chat"), Some("chat"));
        assert_eq!(required_scope("/v1/chat/completions"), Some("chat"));
        assert_eq!(required_scope("/chat"), Some("chat"));
        assert_eq!(required_scope("/v1/plan"), Some("plan"));
        assert_eq!(required_scope("/v1/models"), None);
    }
}
