// OpenAI-compatible request types and the client-facing error taxonomy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::engine::{BudgetError, KeyError, RouteError};
use crate::llm::ChatMessage;

/// Per-request routing overrides, a TokenHub extension to the OpenAI body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingOptions {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub min_context_tokens: Option<u32>,
}

/// `POST /v1/chat` body. `model` is an optional hard override; unset means
/// the routing engine chooses.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub routing: Option<RoutingOptions>,
}

/// One entry in the `GET /v1/models` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    pub context_window: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelListing>,
}

/// Client-facing errors; see the taxonomy in the error-handling design.
#[derive(Debug)]
pub enum ApiError {
    /// 400
    BadRequest(String),
    /// 401
    Unauthorized(String),
    /// 403
    Forbidden(String),
    /// 429 with the budget body shape.
    BudgetExceeded { budget_usd: f64, spent_usd: f64 },
    /// 429
    RateLimited,
    /// 502, body carries the last upstream error text.
    Upstream(String),
    /// 503, includes the selection reason.
    NoCandidate(String),
    /// 500 with the request id.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BudgetExceeded { .. } | ApiError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::NoCandidate(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Invalid | KeyError::NotFound => {
                ApiError::Unauthorized("invalid api key".into())
            }
            KeyError::Expired => ApiError::Unauthorized("api key expired".into()),
            KeyError::Hash(e) => ApiError::Internal(e),
            KeyError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BudgetError> for ApiError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::Exceeded {
                budget_usd,
                spent_usd,
            } => ApiError::BudgetExceeded {
                budget_usd,
                spent_usd,
            },
            BudgetError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoCandidate(reason) => ApiError::NoCandidate(reason),
            RouteError::Provider(e) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            // The budget denial has a flat, documented shape.
            ApiError::BudgetExceeded {
                budget_usd,
                spent_usd,
            } => serde_json::json!({
                "error": "monthly budget exceeded",
                "budget_usd": budget_usd,
                "spent_usd": spent_usd,
            }),
            ApiError::RateLimited => serde_json::json!({
                "error": {"message": "rate limit exceeded", "type": "rate_limit_error"}
            }),
            ApiError::BadRequest(message) => serde_json::json!({
                "error": {"message": message, "type": "invalid_request_error"}
            }),
            ApiError::Unauthorized(message) => serde_json::json!({
                "error": {"message": message, "type": "authentication_error"}
            }),
            ApiError::Forbidden(message) => serde_json::json!({
                "error": {"message": message, "type": "permission_error"}
            }),
            ApiError::Upstream(message) => serde_json::json!({
                "error": {"message": message, "type": "upstream_error"}
            }),
            ApiError::NoCandidate(reason) => serde_json::json!({
                "error": {"message": format!("no candidate model: {reason}"), "type": "no_candidate"}
            }),
            ApiError::Internal(message) => serde_json::json!({
                "error": {"message": message, "type": "internal_error"}
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_accepts_minimal_body() {
        let body: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert!(body.model.is_none());
        assert!(!body.stream);
        assert_eq!(body.messages.len(), 1);
    }

    #[test]
    fn chat_request_accepts_routing_extension() {
        let body: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages": [{"role": "user", "content": "hi"}],
                "routing": {"mode": "cheap", "max_budget_usd": 0.5}}"#,
        )
        .unwrap();
        let routing = body.routing.unwrap();
        assert_eq!(routing.mode.as_deref(), Some("cheap"));
        assert_eq!(routing.max_budget_usd, Some(0.5));
    }

    #[test]
    fn budget_error_uses_flat_body() {
        let response = ApiError::BudgetExceeded {
            budget_usd: 5.0,
            spent_usd: 6.0,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
