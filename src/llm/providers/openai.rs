//! OpenAI-compatible provider adapter
//!
//! Speaks the `/chat/completions` dialect against any OpenAI-shaped base
//! URL. Auth is a bearer token; streams are `data:` framed chunks ending in
//! `[DONE]`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::llm::sse::{openai::event_to_chunk, response_to_sse_stream};
use crate::llm::traits::ProviderAdapter;
use crate::llm::{
    classify_http_error, ChatMessage, ChatRequest, ChunkStream, ProviderError, ProviderResponse,
    ProviderResult, TokenUsage,
};
use crate::models::ProviderKind;

/// Wire shape of an OpenAI chat completion request.
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
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    stream: bool,
}

pub struct OpenAiAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiAdapter {
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
            user: request.user.as_deref(),
            stream,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.id, model = %request.model, %url, "openai request");

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
            return Err(classify_http_error(status, &body, retry_after));
        }
        Ok(response)
    }
}

/// Parse a `Retry-After` header as delay seconds.
pub(super) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull token usage out of an OpenAI-shaped response body.
pub(super) fn usage_from_body(body: &serde_json::Value) -> TokenUsage {
    let usage = &body["usage"];
    TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Openai
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
        classify_http_error(status, body, None)
    }

    fn health_endpoint(&self) -> Option<String> {
        Some(format!("{}/models", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn wire_request_omits_unset_fields() {
        let request = ChatRequest {
            id: Uuid::new_v4(),
            model: "gpt-4o".into(),
            messages: vec![ChatMessage {
                role: crate::llm::MessageRole::User,
                content: "hi".into(),
                name: None,
            }],
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            user: None,
        };
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            user: request.user.as_deref(),
            stream: false,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["stream"], serde_json::json!(false));
    }

    #[test]
    fn usage_extraction_tolerates_missing_fields() {
        let body = serde_json::json!({"id": "x", "choices": []});
        let usage = usage_from_body(&body);
        assert_eq!(usage.total_tokens, 0);

        let body = serde_json::json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}});
        let usage = usage_from_body(&body);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn health_endpoint_points_at_models() {
        let adapter = OpenAiAdapter::new(
            "openai".into(),
            "https://api.openai.com/v1/".into(),
            Some("sk-test".into()),
            reqwest::Client::new(),
        );
        assert_eq!(
            adapter.health_endpoint().as_deref(),
            Some("https://api.openai.com/v1/models")
        );
    }
}
