use llmux_protocol::anthropic;
use llmux_protocol::openai::{
    ChatChunkObject, ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason, Usage,
};
use llmux_protocol::sse::SseEvent;

use crate::stream::{error_chunk_openai, json_data_event};
use crate::translate::openai2anthropic;
use crate::types::TransformMeta;

/// Rewrites an Anthropic Messages event stream into OpenAI
/// `chat.completion.chunk` events.
///
/// The initial role chunk is synthesized from `message_start` because the
/// Messages API never emits an OpenAI-style first event. `ping` and
/// unmapped events produce no output. Exactly one `[DONE]` reaches the
/// client, whether the upstream finished cleanly or not.
pub struct AnthropicToOpenAiState {
    meta: TransformMeta,
    model: String,
    role_sent: bool,
    pending_finish: Option<FinishReason>,
    input_tokens: u32,
    output_tokens: u32,
    closed: bool,
}

impl AnthropicToOpenAiState {
    pub fn new(meta: TransformMeta) -> Self {
        let model = meta.model.clone();
        Self {
            meta,
            model,
            role_sent: false,
            pending_finish: None,
            input_tokens: 0,
            output_tokens: 0,
            closed: false,
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        let parsed: anthropic::StreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.closed = true;
                let mut out = vec![error_chunk_openai(&format!(
                    "unparseable upstream event: {err}"
                ))];
                out.push(SseEvent::data_only("[DONE]"));
                return out;
            }
        };

        let mut out = Vec::new();
        match parsed {
            anthropic::StreamEvent::MessageStart { message } => {
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                out.extend(self.role_chunk());
            }
            anthropic::StreamEvent::ContentBlockStart { content_block, .. } => {
                out.extend(self.role_chunk());
                if let anthropic::ContentBlock::Text { text } = content_block
                    && !text.is_empty()
                {
                    out.extend(self.content_chunk(ChunkDelta {
                        role: None,
                        content: Some(text),
                        reasoning_content: None,
                    }));
                }
            }
            anthropic::StreamEvent::ContentBlockDelta { delta, .. } => {
                out.extend(self.role_chunk());
                match delta {
                    anthropic::ContentDelta::TextDelta { text } => {
                        out.extend(self.content_chunk(ChunkDelta {
                            role: None,
                            content: Some(text),
                            reasoning_content: None,
                        }));
                    }
                    anthropic::ContentDelta::ThinkingDelta { thinking } => {
                        out.extend(self.content_chunk(ChunkDelta {
                            role: None,
                            content: None,
                            reasoning_content: Some(thinking),
                        }));
                    }
                    anthropic::ContentDelta::InputJsonDelta { .. } => {}
                }
            }
            anthropic::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(stop) = delta.stop_reason {
                    self.pending_finish = Some(openai2anthropic::finish_reason(stop));
                }
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
            }
            anthropic::StreamEvent::MessageStop => {
                out.extend(self.terminate());
            }
            anthropic::StreamEvent::Error { error } => {
                self.closed = true;
                out.push(error_chunk_openai(&error.message));
                out.push(SseEvent::data_only("[DONE]"));
            }
            anthropic::StreamEvent::ContentBlockStop { .. }
            | anthropic::StreamEvent::Ping
            | anthropic::StreamEvent::Unknown => {}
        }
        out
    }

    /// Upstream closed. Emits the finish chunk and `[DONE]` if the stream
    /// never reached `message_stop`.
    pub fn close(&mut self) -> Vec<SseEvent> {
        self.terminate()
    }

    fn terminate(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut out = Vec::new();
        let finish = self.pending_finish.take().unwrap_or(FinishReason::Stop);
        let chunk = ChatCompletionChunk {
            id: self.meta.completion_id(),
            object: ChatChunkObject::ChatCompletionChunk,
            created: self.meta.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish),
            }],
            usage: Some(Usage::new(self.input_tokens, self.output_tokens)),
            prompt_filter_results: None,
        };
        out.extend(json_data_event(&chunk));
        out.push(SseEvent::data_only("[DONE]"));
        out
    }

    fn role_chunk(&mut self) -> Vec<SseEvent> {
        if self.role_sent {
            return Vec::new();
        }
        self.role_sent = true;
        let chunk = ChatCompletionChunk::initial_role_chunk(
            &self.meta.completion_id(),
            &self.model,
            self.meta.created,
        );
        json_data_event(&chunk).into_iter().collect()
    }

    fn content_chunk(&mut self, delta: ChunkDelta) -> Vec<SseEvent> {
        let chunk = ChatCompletionChunk {
            id: self.meta.completion_id(),
            object: ChatChunkObject::ChatCompletionChunk,
            created: self.meta.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
            prompt_filter_results: None,
        };
        json_data_event(&chunk).into_iter().collect()
    }
}

impl std::fmt::Debug for AnthropicToOpenAiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicToOpenAiState")
            .field("role_sent", &self.role_sent)
            .field("closed", &self.closed)
            .finish()
    }
}
