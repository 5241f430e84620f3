//! vLLM provider adapter
//!
//! vLLM serves the OpenAI dialect, usually unauthenticated on a local base
//! URL. The differences worth modeling are the error strings its scheduler
//! emits when a prompt exceeds the KV budget.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::llm::sse::{openai::event_to_chunk, response_to_sse_stream};
use crate::llm::traits::ProviderAdapter;
use crate::llm::{
    classify_http_error, ChatMessage, ChatRequest, ChunkStream, ProviderError, ProviderResponse,
    ProviderResult,
};
use crate::models::ProviderKind;

use super::openai::{parse_retry_after, usage_from_body};

/// vLLM-specific phrasings of a context overflow.
const VLLM_OVERFLOW_HINTS: &[&str] = &[
    "maximum model length",
    "kv cache",
    "decoder prompt",
];

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

pub struct VllmAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl VllmAdapter {
    pub fn new(
        id: String,
        base_url: String,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn headers(&self) -> ProviderResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| ProviderError::Fatal(format!("invalid API key format: {e}")))?,
            );
        }
        Ok(headers)
    }

    async fn post_chat(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> ProviderResult<reqwest::Response> {
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            stream,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.id, model = %request.model, %url, "vllm request");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&wire)
            .send()
            .await
            .map_err(|e| ProviderError::from_network(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_else(|_| "unknown error".into());
            return Err(classify_vllm_error(status, &body, retry_after));
        }
        Ok(response)
    }
}

fn classify_vllm_error(
    status: u16,
    body: &str,
    retry_after: Option<std::time::Duration>,
) -> ProviderError {
    let lower = body.to_lowercase();
    // Shared precedence still applies: 429 outranks an overflow phrasing.
    if status != 429 && VLLM_OVERFLOW_HINTS.iter().any(|h| lower.contains(h)) {
        return ProviderError::ContextOverflow(body.chars().take(512).collect());
    }
    classify_http_error(status, body, retry_after)
}

#[async_trait]
impl ProviderAdapter for VllmAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Vllm
    }

    async fn send(&self, request: &ChatRequest) -> ProviderResult<ProviderResponse> {
        let response = self.post_chat(request, false).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad upstream JSON: {e}")))?;
        let usage = usage_from_body(&body);
        Ok(ProviderResponse { body, usage })
    }

    async fn send_stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream> {
        let response = self.post_chat(&request, true).await?;
        let sse_stream = response_to_sse_stream(response);
        let chunk_stream = sse_stream.filter_map(|sse_result| async move {
            match sse_result {
                Ok(event) => event_to_chunk(&event).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::new(Box::pin(chunk_stream)))
    }

    fn classify_error(&self, status: u16, body: &str) -> ProviderError {
        classify_vllm_error(status, body, None)
    }

    fn health_endpoint(&self) -> Option<String> {
        Some(format!("{}/models", self.base_url))
    }
}
