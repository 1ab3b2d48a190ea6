//! Streaming dialect transformers.
//!
//! Each transformer is a state machine fed one parsed SSE event at a time
//! by the framing layer and returning events in the client's dialect.
//! `close()` must be called when the upstream ends; every stream emits
//! exactly one terminator (a `[DONE]` sentinel, a `message_stop`, or a
//! typed error event) no matter how the upstream died.

pub mod anthropic2openai;
pub mod google2openai;
pub mod openai2anthropic;
pub mod openai_passthrough;

use serde::Serialize;

use llmux_common::Dialect;
use llmux_protocol::error::{ProxyErrorPayload, UpstreamErrorBody};
use llmux_protocol::sse::SseEvent;

use crate::types::{TransformMeta, TranslateError};

use anthropic2openai::AnthropicToOpenAiState;
use google2openai::GoogleToOpenAiState;
use openai2anthropic::OpenAiToAnthropicState;
use openai_passthrough::OpenAiPassthroughState;

pub enum StreamTransformer {
    /// Upstream and client both speak OpenAI (or Mistral, whose chunks are
    /// OpenAI-shaped): repair-only passthrough.
    OpenAiRepair(OpenAiPassthroughState),
    AnthropicToOpenAi(AnthropicToOpenAiState),
    GoogleToOpenAi(GoogleToOpenAiState),
    OpenAiToAnthropic(OpenAiToAnthropicState),
    /// Same-dialect native streams that need no rewriting.
    Verbatim(VerbatimState),
}

impl StreamTransformer {
    pub fn new(
        upstream: Dialect,
        client: Dialect,
        meta: TransformMeta,
    ) -> Result<Self, TranslateError> {
        let transformer = match (upstream, client) {
            (Dialect::Openai | Dialect::Mistral, Dialect::Openai | Dialect::Mistral) => {
                StreamTransformer::OpenAiRepair(OpenAiPassthroughState::new())
            }
            (Dialect::Anthropic, Dialect::Openai) => {
                StreamTransformer::AnthropicToOpenAi(AnthropicToOpenAiState::new(meta))
            }
            (Dialect::GoogleAi, Dialect::Openai) => {
                StreamTransformer::GoogleToOpenAi(GoogleToOpenAiState::new(meta))
            }
            (Dialect::Openai, Dialect::Anthropic) => {
                StreamTransformer::OpenAiToAnthropic(OpenAiToAnthropicState::new(meta))
            }
            (Dialect::Anthropic, Dialect::Anthropic) => {
                StreamTransformer::Verbatim(VerbatimState::new(Dialect::Anthropic))
            }
            (Dialect::GoogleAi, Dialect::GoogleAi) => {
                StreamTransformer::Verbatim(VerbatimState::new(Dialect::GoogleAi))
            }
            (src, dst) => return Err(TranslateError::UnsupportedPair { src, dst }),
        };
        Ok(transformer)
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        match self {
            StreamTransformer::OpenAiRepair(state) => state.push(event),
            StreamTransformer::AnthropicToOpenAi(state) => state.push(event),
            StreamTransformer::GoogleToOpenAi(state) => state.push(event),
            StreamTransformer::OpenAiToAnthropic(state) => state.push(event),
            StreamTransformer::Verbatim(state) => state.push(event),
        }
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        match self {
            StreamTransformer::OpenAiRepair(state) => state.close(),
            StreamTransformer::AnthropicToOpenAi(state) => state.close(),
            StreamTransformer::GoogleToOpenAi(state) => state.close(),
            StreamTransformer::OpenAiToAnthropic(state) => state.close(),
            StreamTransformer::Verbatim(state) => state.close(),
        }
    }
}

/// Forwarding state for native same-dialect streams. Still owns the
/// exactly-one-terminator guarantee.
pub struct VerbatimState {
    dialect: Dialect,
    terminated: bool,
}

impl VerbatimState {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            terminated: false,
        }
    }

    fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.terminated {
            return Vec::new();
        }
        if self.dialect == Dialect::Anthropic
            && (event.event.as_deref() == Some("message_stop")
                || event.event.as_deref() == Some("error"))
        {
            self.terminated = true;
        }
        vec![event.clone()]
    }

    fn close(&mut self) -> Vec<SseEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        match self.dialect {
            // A Gemini stream simply ends; closing the connection is the
            // terminator and nothing more is owed to the client.
            Dialect::GoogleAi => Vec::new(),
            Dialect::Anthropic => vec![error_event_anthropic("upstream ended before message_stop")],
            Dialect::Openai | Dialect::Mistral => vec![SseEvent::data_only("[DONE]")],
        }
    }
}

/// Serialize any event payload into a data-only SSE event. Serialization
/// of locally-built values cannot fail in practice; a failure yields no
/// event rather than a broken frame.
pub(crate) fn json_data_event<T: Serialize>(value: &T) -> Option<SseEvent> {
    serde_json::to_string(value).ok().map(SseEvent::data_only)
}

/// Serialize an Anthropic stream event with its `event:` name attached.
pub(crate) fn named_json_event(
    event: &llmux_protocol::anthropic::StreamEvent,
) -> Option<SseEvent> {
    serde_json::to_string(event).ok().map(|data| SseEvent {
        event: Some(event.event_name().to_string()),
        data,
    })
}

/// OpenAI-dialect error event, sent after headers when a stream dies.
pub(crate) fn error_chunk_openai(message: &str) -> SseEvent {
    let payload = ProxyErrorPayload::new("proxy_stream_error", message, "stream terminated");
    SseEvent::data_only(serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string()))
}

/// Anthropic-dialect error event.
pub(crate) fn error_event_anthropic(message: &str) -> SseEvent {
    let event = llmux_protocol::anthropic::StreamEvent::Error {
        error: UpstreamErrorBody {
            message: message.to_string(),
            error_type: Some("proxy_stream_error".to_string()),
            code: None,
            status: None,
            details: None,
        },
    };
    SseEvent {
        event: Some("error".to_string()),
        data: serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()),
    }
}
