use serde::{Deserialize, Serialize};

use crate::openai;

/// Mistral's chat surface is OpenAI-adjacent but not identical: it rejects
/// unknown fields like `logit_bias`, renames `seed`, and adds
/// `safe_prompt`. Responses and stream chunks are OpenAI-shaped and reuse
/// those types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<openai::ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_prompt: Option<bool>,
}

pub type ChatResponse = openai::ChatCompletionResponse;
pub type ChatChunk = openai::ChatCompletionChunk;
