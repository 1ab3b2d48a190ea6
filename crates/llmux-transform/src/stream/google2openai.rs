use llmux_protocol::google;
use llmux_protocol::openai::{
    ChatChunkObject, ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason, Usage,
};
use llmux_protocol::sse::SseEvent;

use crate::stream::{error_chunk_openai, json_data_event};
use crate::translate::openai2google;
use crate::types::TransformMeta;

/// Rewrites a `streamGenerateContent?alt=sse` stream into OpenAI chunks.
/// Gemini streams have no terminator sentinel; the final chunk and
/// `[DONE]` are emitted when the upstream connection closes (or as soon
/// as a candidate reports a finish reason and usage has arrived).
pub struct GoogleToOpenAiState {
    meta: TransformMeta,
    role_sent: bool,
    pending_finish: Option<FinishReason>,
    usage: Option<Usage>,
    closed: bool,
}

impl GoogleToOpenAiState {
    pub fn new(meta: TransformMeta) -> Self {
        Self {
            meta,
            role_sent: false,
            pending_finish: None,
            usage: None,
            closed: false,
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        let parsed: google::GenerateContentResponse = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.closed = true;
                return vec![
                    error_chunk_openai(&format!("unparseable upstream event: {err}")),
                    SseEvent::data_only("[DONE]"),
                ];
            }
        };

        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            let chunk = ChatCompletionChunk::initial_role_chunk(
                &self.meta.completion_id(),
                &self.meta.model,
                self.meta.created,
            );
            out.extend(json_data_event(&chunk));
        }

        if let Some(usage) = parsed.usage_metadata {
            self.usage = Some(Usage::new(
                usage.prompt_token_count,
                usage.candidates_token_count,
            ));
        }

        for candidate in &parsed.candidates {
            if let Some(content) = &candidate.content {
                let text: String = content
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        google::Part::Text(text) => Some(text.as_str()),
                        google::Part::InlineData(_) => None,
                    })
                    .collect();
                if !text.is_empty() {
                    out.extend(self.content_chunk(text));
                }
            }
            if let Some(finish) = candidate.finish_reason {
                self.pending_finish = Some(openai2google::finish_reason(finish));
            }
        }
        out
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let finish = self.pending_finish.take().unwrap_or(FinishReason::Stop);
        let chunk = ChatCompletionChunk {
            id: self.meta.completion_id(),
            object: ChatChunkObject::ChatCompletionChunk,
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish),
            }],
            usage: self.usage.take(),
            prompt_filter_results: None,
        };
        let mut out: Vec<SseEvent> = json_data_event(&chunk).into_iter().collect();
        out.push(SseEvent::data_only("[DONE]"));
        out
    }

    fn content_chunk(&self, text: String) -> Vec<SseEvent> {
        let chunk = ChatCompletionChunk {
            id: self.meta.completion_id(),
            object: ChatChunkObject::ChatCompletionChunk,
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(text),
                    reasoning_content: None,
                },
                finish_reason: None,
            }],
            usage: None,
            prompt_filter_results: None,
        };
        json_data_event(&chunk).into_iter().collect()
    }
}
