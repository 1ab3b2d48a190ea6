use llmux_protocol::anthropic::{
    ContentBlock, ContentDelta, MessageDelta, MessageRole, MessagesResponse, MessagesUsage,
    StopReason, StreamEvent as AnthropicEvent,
};
use llmux_protocol::openai::ChatCompletionChunk;
use llmux_protocol::sse::SseEvent;

use crate::stream::{error_event_anthropic, named_json_event};
use crate::translate::anthropic2openai;
use crate::types::TransformMeta;

/// Rewrites OpenAI `chat.completion.chunk` events into Anthropic Messages
/// stream events: `message_start`, one text content block, deltas, then
/// `message_delta`/`message_stop`.
pub struct OpenAiToAnthropicState {
    meta: TransformMeta,
    model: String,
    started: bool,
    block_open: bool,
    pending_stop: Option<StopReason>,
    output_tokens: u32,
    input_tokens: u32,
    closed: bool,
}

impl OpenAiToAnthropicState {
    pub fn new(meta: TransformMeta) -> Self {
        let model = meta.model.clone();
        Self {
            meta,
            model,
            started: false,
            block_open: false,
            pending_stop: None,
            output_tokens: 0,
            input_tokens: 0,
            closed: false,
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if event.is_done_sentinel() {
            return self.terminate();
        }
        let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.closed = true;
                return vec![error_event_anthropic(&format!(
                    "unparseable upstream event: {err}"
                ))];
            }
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            self.model = chunk.model.clone();
            let start = AnthropicEvent::MessageStart {
                message: MessagesResponse {
                    id: self.meta.message_id(),
                    response_type: "message".to_string(),
                    role: MessageRole::Assistant,
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: MessagesUsage::default(),
                },
            };
            out.extend(named_json_event(&start));
        }

        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                if !self.block_open {
                    self.block_open = true;
                    out.extend(named_json_event(&AnthropicEvent::ContentBlockStart {
                        index: 0,
                        content_block: ContentBlock::Text {
                            text: String::new(),
                        },
                    }));
                }
                out.extend(named_json_event(&AnthropicEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentDelta::TextDelta { text: text.clone() },
                }));
            }
            if let Some(finish) = choice.finish_reason {
                self.pending_stop = Some(anthropic2openai::stop_reason_of(finish));
            }
        }
        out
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        self.terminate()
    }

    fn terminate(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut out = Vec::new();
        if self.block_open {
            out.extend(named_json_event(&AnthropicEvent::ContentBlockStop {
                index: 0,
            }));
        }
        out.extend(named_json_event(&AnthropicEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.pending_stop.take().unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Some(MessagesUsage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            }),
        }));
        out.extend(named_json_event(&AnthropicEvent::MessageStop));
        out
    }
}
