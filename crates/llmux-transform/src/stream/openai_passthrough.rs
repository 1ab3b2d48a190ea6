use llmux_protocol::openai::ChatCompletionChunk;
use llmux_protocol::sse::SseEvent;

use crate::stream::{error_chunk_openai, json_data_event};

/// Same-dialect OpenAI stream repair. Two jobs:
///
/// - Azure prepends a chunk carrying only `prompt_filter_results`; it is
///   dropped so clients see a spec-shaped stream.
/// - Some OpenAI-compatible upstreams (Mistral included) omit the initial
///   `delta = {role, content: ""}` chunk; it is synthesized ahead of the
///   first content chunk when missing.
pub struct OpenAiPassthroughState {
    first_seen: bool,
    role_seen: bool,
    closed: bool,
}

impl OpenAiPassthroughState {
    pub fn new() -> Self {
        Self {
            first_seen: false,
            role_seen: false,
            closed: false,
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if event.is_done_sentinel() {
            self.closed = true;
            return vec![SseEvent::data_only("[DONE]")];
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.closed = true;
                return vec![
                    error_chunk_openai(&format!("unparseable upstream event: {err}")),
                    SseEvent::data_only("[DONE]"),
                ];
            }
        };

        let is_first = !self.first_seen;
        self.first_seen = true;

        // Azure's moderation preamble: no choices, only filter metadata.
        if is_first && chunk.prompt_filter_results.is_some() && chunk.choices.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let carries_role = chunk
            .choices
            .first()
            .is_some_and(|choice| choice.delta.role.is_some());
        if carries_role {
            self.role_seen = true;
        } else if !self.role_seen {
            self.role_seen = true;
            let initial = ChatCompletionChunk::initial_role_chunk(
                &chunk.id,
                &chunk.model,
                chunk.created,
            );
            out.extend(json_data_event(&initial));
        }

        out.extend(json_data_event(&chunk));
        out
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        // Upstream died without [DONE]; still terminate exactly once.
        vec![SseEvent::data_only("[DONE]")]
    }
}

impl Default for OpenAiPassthroughState {
    fn default() -> Self {
        Self::new()
    }
}
