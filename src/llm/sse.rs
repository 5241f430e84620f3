//! Server-Sent Events parsing for streamed completions
//!
//! Each upstream frames its stream differently; this module provides the
//! generic SSE event parser plus per-provider conversions into the
//! normalized OpenAI-shaped [`StreamingChunk`].

use futures::{Stream, StreamExt};
use tracing::debug;

use super::{ProviderError, ProviderResult, StreamingChoice, StreamingChunk, StreamingDelta};

/// One parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental SSE parser; feed it byte chunks, get whole events back.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a byte chunk into zero or more complete events. Partial events
    /// stay buffered until the terminating blank line arrives.
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> ProviderResult<Vec<SseEvent>> {
        let chunk_str = std::str::from_utf8(chunk)
            .map_err(|e| ProviderError::Transient(format!("invalid UTF-8 in SSE stream: {e}")))?;
        self.buffer.push_str(chunk_str);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if !block.trim().is_empty() {
                events.push(Self::parse_event_block(&block));
            }
        }
        Ok(events)
    }

    fn parse_event_block(block: &str) -> SseEvent {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            match line.split_once(':') {
                Some(("event", value)) => event_type = Some(value.trim_start().to_string()),
                Some(("data", value)) => data_lines.push(value.trim_start().to_string()),
                Some(_) => {}
                None => data_lines.push(line.to_string()),
            }
        }

        SseEvent {
            event_type,
            data: data_lines.join("\n"),
        }
    }
}

/// Convert a reqwest response into a stream of SSE events.
pub fn response_to_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = ProviderResult<SseEvent>> + Send + Unpin {
    let byte_stream = response.bytes_stream();
    let mut parser = SseParser::new();

    Box::pin(
        byte_stream
            .map(move |chunk_result| match chunk_result {
                Ok(chunk) => parser.parse_chunk(&chunk),
                Err(e) => Err(ProviderError::Transient(e.to_string())),
            })
            .flat_map(|events_result| {
                futures::stream::iter(match events_result {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            }),
    )
}

/// OpenAI-compatible stream framing (also used by vLLM).
pub mod openai {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct StreamChunk {
        id: String,
        object: String,
        created: u64,
        model: String,
        choices: Vec<StreamChoice>,
    }

    #[derive(Debug, Deserialize)]
    struct StreamChoice {
        index: u32,
        delta: Delta,
        finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct Delta {
        role: Option<String>,
        content: Option<String>,
    }

    /// Convert one OpenAI SSE event into a normalized chunk.
    pub fn event_to_chunk(event: &SseEvent) -> ProviderResult<Option<StreamingChunk>> {
        let data = event.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| ProviderError::Transient(format!("bad OpenAI stream chunk: {e}")))?;

        Ok(Some(StreamingChunk {
            id: chunk.id,
            object: chunk.object,
            created: chunk.created,
            model: chunk.model,
            choices: chunk
                .choices
                .into_iter()
                .map(|c| StreamingChoice {
                    index: c.index,
                    delta: StreamingDelta {
                        role: c.delta.role,
                        content: c.delta.content,
                    },
                    finish_reason: c.finish_reason,
                })
                .collect(),
        }))
    }
}

/// Anthropic stream framing (`message_start` / `content_block_delta` / ...).
pub mod anthropic {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    enum StreamEvent {
        #[serde(rename = "ping")]
        Ping,

        #[serde(rename = "message_start")]
        MessageStart,

        #[serde(rename = "content_block_start")]
        ContentBlockStart,

        #[serde(rename = "content_block_delta")]
        ContentBlockDelta { delta: Delta },

        #[serde(rename = "content_block_stop")]
        ContentBlockStop,

        #[serde(rename = "message_delta")]
        MessageDelta { delta: MessageDelta },

        #[serde(rename = "message_stop")]
        MessageStop,

        #[serde(rename = "error")]
        Error { error: StreamError },
    }

    #[derive(Debug, Deserialize)]
    struct Delta {
        text: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct MessageDelta {
        stop_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct StreamError {
        message: String,
    }

    /// Convert one Anthropic SSE event into a normalized chunk. The caller
    /// supplies the request id and model, which Anthropic only sends in the
    /// opening frame.
    pub fn event_to_chunk(
        event: &SseEvent,
        request_id: &str,
        model: &str,
    ) -> ProviderResult<Option<StreamingChunk>> {
        let data = event.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }

        let stream_event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| ProviderError::Transient(format!("bad Anthropic stream event: {e}")))?;

        let chunk = |content: Option<String>, finish: Option<String>| StreamingChunk {
            id: request_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.to_string(),
            choices: vec![StreamingChoice {
                index: 0,
                delta: StreamingDelta {
                    role: Some("assistant".to_string()),
                    content,
                },
                finish_reason: finish,
            }],
        };

        match stream_event {
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) => Ok(Some(chunk(Some(text), None))),
                None => Ok(None),
            },
            StreamEvent::MessageDelta { delta } => match delta.stop_reason {
                Some(reason) => Ok(Some(chunk(None, Some(reason)))),
                None => Ok(None),
            },
            StreamEvent::Error { error } => Err(ProviderError::Transient(format!(
                "anthropic stream error: {}",
                error.message
            ))),
            _ => {
                debug!(event = ?event.event_type, "ignoring non-content stream event");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_event() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"event: message\ndata: hello world\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "hello world");
    }

    #[test]
    fn parses_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: first\n\ndata: second\n\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn buffers_incomplete_events_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: incomplete").unwrap().is_empty());
        let events = parser.parse_chunk(b"\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "incomplete");
    }

    #[test]
    fn openai_delta_maps_to_chunk() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#.into(),
        };
        let chunk = openai::event_to_chunk(&event).unwrap().unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn openai_done_marker_is_skipped() {
        let event = SseEvent {
            event_type: None,
            data: "[DONE]".into(),
        };
        assert!(openai::event_to_chunk(&event).unwrap().is_none());
    }

    #[test]
    fn anthropic_content_delta_maps_to_chunk() {
        let event = SseEvent {
            event_type: Some("content_block_delta".into()),
            data: r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#.into(),
        };
        let chunk = anthropic::event_to_chunk(&event, "req-1", "claude-3-5-sonnet")
            .unwrap()
            .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
        assert_eq!(chunk.model, "claude-3-5-sonnet");
    }

    #[test]
    fn anthropic_message_delta_carries_finish_reason() {
        let event = SseEvent {
            event_type: Some("message_delta".into()),
            data: r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#.into(),
        };
        let chunk = anthropic::event_to_chunk(&event, "req-1", "claude-3-5-sonnet")
            .unwrap()
            .unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("end_turn"));
    }
}
