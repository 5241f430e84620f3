// LLM provider plumbing for TokenHub
// Wire types shared by all upstream adapters, plus the classified error
// taxonomy the routing engine retries and escalates on.

//! # LLM Provider Module
//!
//! This module provides the upstream-facing half of TokenHub: the common
//! request/response wire types, the [`traits::ProviderAdapter`] capability
//! set every upstream implements, SSE parsing for streamed completions, and
//! the concrete OpenAI / Anthropic / vLLM adapters.
//!
//! The routing engine never talks HTTP itself; it sees adapters as
//! `{send, send_stream, classify_error, id, health_endpoint}` and reacts to
//! the classified [`ProviderError`] they raise.

pub mod providers;
pub mod sse;
pub mod traits;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message roles in the OpenAI-compatible chat shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The request handed to an adapter after routing has picked a model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub id: Uuid,
    /// Concrete model id on the chosen provider.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub user: Option<String>,
}

impl ChatRequest {
    /// Total content bytes across messages; the routing token estimate
    /// divides this by four.
    pub fn content_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Token accounting extracted from an upstream response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A completed upstream response.
///
/// `body` is the provider's response document, returned to the client
/// verbatim; `usage` is extracted for accounting.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub body: serde_json::Value,
    pub usage: TokenUsage,
}

/// One OpenAI-shaped streaming chunk, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamingChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChoice {
    pub index: u32,
    pub delta: StreamingDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Boxed chunk stream returned by `send_stream`.
pub type ChunkStream =
    Box<dyn futures::Stream<Item = Result<StreamingChunk, ProviderError>> + Send + Unpin>;

/// Classified upstream errors. The routing engine's reaction is determined
/// entirely by the variant: re-select on `RateLimited`/`Transient`, escalate
/// on `ContextOverflow`, surface `Fatal` immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Short class label written to logs and reward rows.
    pub fn class(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::ContextOverflow(_) => "context_overflow",
            ProviderError::Transient(_) => "transient",
            ProviderError::Fatal(_) => "fatal",
        }
    }

    /// Whether the engine should re-select a candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    /// Network-level failures are always transient.
    pub fn from_network(err: &reqwest::Error) -> Self {
        ProviderError::Transient(err.to_string())
    }
}

/// Result alias for adapter operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

const CONTEXT_OVERFLOW_HINTS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context",
    "prompt is too long",
    "too many tokens",
    "input is too long",
];

const RATE_LIMIT_HINTS: &[&str] = &["rate limit", "rate_limit", "overloaded", "quota"];

/// Shared classification over an HTTP status and error body.
///
/// Some provider error bodies contain both context-overflow and rate-limit
/// hints; precedence is rate-limited > context-overflow > transient > fatal.
pub fn classify_http_error(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let lower = body.to_lowercase();

    if status == 429 || RATE_LIMIT_HINTS.iter().any(|h| lower.contains(h)) {
        return ProviderError::RateLimited {
            message: truncate(body, 512),
            retry_after,
        };
    }
    if CONTEXT_OVERFLOW_HINTS.iter().any(|h| lower.contains(h)) {
        return ProviderError::ContextOverflow(truncate(body, 512));
    }
    if status >= 500 || status == 408 {
        return ProviderError::Transient(format!("HTTP {}: {}", status, truncate(body, 512)));
    }
    ProviderError::Fatal(format!("HTTP {}: {}", status, truncate(body, 512)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_wins_over_overflow_hint() {
        // Body carries both hints; rate-limited takes precedence.
        let err = classify_http_error(400, "rate limit reached: prompt is too long", None);
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[test]
    fn overflow_beats_transient() {
        let err = classify_http_error(500, "maximum context length exceeded", None);
        assert!(matches!(err, ProviderError::ContextOverflow(_)));
    }

    #[test]
    fn status_429_is_rate_limited() {
        let err = classify_http_error(429, "slow down", Some(Duration::from_secs(2)));
        match err {
            ProviderError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn five_hundreds_are_transient_and_four_hundreds_fatal() {
        assert!(matches!(
            classify_http_error(503, "upstream sad", None),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            classify_http_error(401, "bad key", None),
            ProviderError::Fatal(_)
        ));
    }
}
