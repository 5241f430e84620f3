//! Anthropic provider adapter
//!
//! Speaks the Messages API: `x-api-key` auth, system prompt hoisted out of
//! the message list, typed SSE events instead of bare chunks.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::llm::sse::{anthropic::event_to_chunk, response_to_sse_stream};
use crate::llm::traits::ProviderAdapter;
use crate::llm::{
    classify_http_error, ChatRequest, ChunkStream, MessageRole, ProviderError, ProviderResponse,
    ProviderResult, TokenUsage,
};
use crate::models::ProviderKind;

use super::openai::parse_retry_after;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    stream: bool,
}

pub struct AnthropicAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AnthropicAdapter {
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
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        if let Some(key) = &self.api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(key)
                    .map_err(|e| ProviderError::Fatal(format!("invalid API key format: {e}")))?,
            );
        }
        Ok(headers)
    }

    /// System messages move to the dedicated `system` field; everything else
    /// keeps its role.
    fn convert(request: &ChatRequest, stream: bool) -> WireRequest<'_> {
        let system = {
            let parts: Vec<&str> = request
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::System)
                .map(|m| m.content.as_str())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        };

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| WireMessage {
                role: match m.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();

        WireRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.as_deref(),
            stream,
        }
    }

    async fn post_messages(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> ProviderResult<reqwest::Response> {
        let wire = Self::convert(request, stream);
        let url = format!("{}/v1/messages", self.base_url);
        debug!(provider = %self.id, model = %request.model, %url, "anthropic request");

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

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn send(&self, request: &ChatRequest) -> ProviderResult<ProviderResponse> {
        let response = self.post_messages(request, false).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad upstream JSON: {e}")))?;

        let usage = TokenUsage {
            prompt_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            completion_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };
        Ok(ProviderResponse { body, usage })
    }

    async fn send_stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream> {
        let request_id = request.id.to_string();
        let model = request.model.clone();

        let response = self.post_messages(&request, true).await?;
        let sse_stream = response_to_sse_stream(response);
        let chunk_stream = sse_stream.filter_map(move |sse_result| {
            let request_id = request_id.clone();
            let model = model.clone();
            async move {
                match sse_result {
                    Ok(event) => event_to_chunk(&event, &request_id, &model).transpose(),
                    Err(e) => Some(Err(e)),
                }
            }
        });
        Ok(Box::new(Box::pin(chunk_stream)))
    }

    fn classify_error(&self, status: u16, body: &str) -> ProviderError {
        classify_http_error(status, body, None)
    }

    fn health_endpoint(&self) -> Option<String> {
        // Anthropic has no unauthenticated health route worth probing.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use uuid::Uuid;

    fn request() -> ChatRequest {
        ChatRequest {
            id: Uuid::new_v4(),
            model: "claude-3-5-sonnet-latest".into(),
            messages: vec![
                ChatMessage {
                    role: MessageRole::System,
                    content: "be terse".into(),
                    name: None,
                },
                ChatMessage {
                    role: MessageRole::User,
                    content: "hi".into(),
                    name: None,
                },
            ],
            temperature: Some(0.2),
            max_tokens: None,
            top_p: None,
            stop: None,
            user: None,
        }
    }

    #[test]
    fn system_messages_hoist_to_system_field() {
        let request = request();
        let wire = AnthropicAdapter::convert(&request, false);
        assert_eq!(wire.system.as_deref(), Some("be terse"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let request = request();
        let wire = AnthropicAdapter::convert(&request, false);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }
}
