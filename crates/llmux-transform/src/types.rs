use llmux_common::Dialect;
use llmux_protocol::{anthropic, google, mistral, openai};

/// A parsed inbound or outbound chat request, tagged by dialect.
#[derive(Debug, Clone)]
pub enum ChatRequest {
    OpenAi(openai::ChatCompletionRequest),
    Anthropic(anthropic::MessagesRequest),
    Google(GoogleChat),
    Mistral(mistral::ChatRequest),
}

/// Google keeps the model and stream mode in the URL rather than the body.
#[derive(Debug, Clone)]
pub struct GoogleChat {
    pub model: String,
    pub stream: bool,
    pub body: google::GenerateContentRequest,
}

impl ChatRequest {
    pub fn dialect(&self) -> Dialect {
        match self {
            ChatRequest::OpenAi(_) => Dialect::Openai,
            ChatRequest::Anthropic(_) => Dialect::Anthropic,
            ChatRequest::Google(_) => Dialect::GoogleAi,
            ChatRequest::Mistral(_) => Dialect::Mistral,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ChatRequest::OpenAi(req) => &req.model,
            ChatRequest::Anthropic(req) => &req.model,
            ChatRequest::Google(req) => &req.model,
            ChatRequest::Mistral(req) => &req.model,
        }
    }

    pub fn set_model(&mut self, model: String) {
        match self {
            ChatRequest::OpenAi(req) => req.model = model,
            ChatRequest::Anthropic(req) => req.model = model,
            ChatRequest::Google(req) => req.model = model,
            ChatRequest::Mistral(req) => req.model = model,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            ChatRequest::OpenAi(req) => req.stream.unwrap_or(false),
            ChatRequest::Anthropic(req) => req.stream.unwrap_or(false),
            ChatRequest::Google(req) => req.stream,
            ChatRequest::Mistral(req) => req.stream.unwrap_or(false),
        }
    }

    /// The client's requested completion budget, when present.
    pub fn max_tokens(&self) -> Option<u32> {
        match self {
            ChatRequest::OpenAi(req) => req.max_completion_tokens.or(req.max_tokens),
            ChatRequest::Anthropic(req) => Some(req.max_tokens),
            ChatRequest::Google(req) => req
                .body
                .generation_config
                .as_ref()
                .and_then(|config| config.max_output_tokens),
            ChatRequest::Mistral(req) => req.max_tokens,
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            ChatRequest::OpenAi(req) => req
                .messages
                .iter()
                .map(|message| message.content.image_count())
                .sum(),
            ChatRequest::Anthropic(req) => req
                .messages
                .iter()
                .map(|message| message.content.image_count())
                .sum(),
            ChatRequest::Google(req) => req
                .body
                .contents
                .iter()
                .flat_map(|content| content.parts.iter())
                .filter(|part| matches!(part, google::Part::InlineData(_)))
                .count(),
            ChatRequest::Mistral(req) => req
                .messages
                .iter()
                .map(|message| message.content.image_count())
                .sum(),
        }
    }
}

/// A parsed blocking upstream response, tagged by dialect.
#[derive(Debug, Clone)]
pub enum ChatResponse {
    OpenAi(openai::ChatCompletionResponse),
    Anthropic(anthropic::MessagesResponse),
    Google(google::GenerateContentResponse),
}

impl ChatResponse {
    pub fn dialect(&self) -> Dialect {
        match self {
            ChatResponse::OpenAi(_) => Dialect::Openai,
            ChatResponse::Anthropic(_) => Dialect::Anthropic,
            ChatResponse::Google(_) => Dialect::GoogleAi,
        }
    }

    /// Actual completion tokens the upstream reported, when it did.
    pub fn reported_output_tokens(&self) -> Option<u32> {
        match self {
            ChatResponse::OpenAi(resp) => resp.usage.map(|usage| usage.completion_tokens),
            ChatResponse::Anthropic(resp) => Some(resp.usage.output_tokens),
            ChatResponse::Google(resp) => resp
                .usage_metadata
                .map(|usage| usage.candidates_token_count),
        }
    }

    pub fn completion_text(&self) -> String {
        match self {
            ChatResponse::OpenAi(resp) => resp
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .unwrap_or_default(),
            ChatResponse::Anthropic(resp) => resp
                .content
                .iter()
                .filter_map(|block| match block {
                    anthropic::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            ChatResponse::Google(resp) => resp
                .candidates
                .first()
                .and_then(|candidate| candidate.content.as_ref())
                .map(|content| {
                    content
                        .parts
                        .iter()
                        .filter_map(|part| match part {
                            google::Part::Text(text) => Some(text.as_str()),
                            google::Part::InlineData(_) => None,
                        })
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
        }
    }
}

/// Identity chosen at preprocess time; every synthesized id and timestamp
/// derives from it so translation stays deterministic under test.
#[derive(Debug, Clone)]
pub struct TransformMeta {
    pub request_id: String,
    pub model: String,
    pub created: i64,
}

impl TransformMeta {
    pub fn completion_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id)
    }

    pub fn message_id(&self) -> String {
        format!("msg_{}", self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// No transform exists for this dialect pair.
    UnsupportedPair { src: Dialect, dst: Dialect },
    /// The body violated the source dialect's schema.
    Schema(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::UnsupportedPair { src, dst } => {
                write!(f, "no translation from {src} to {dst}")
            }
            TranslateError::Schema(message) => write!(f, "schema violation: {message}"),
        }
    }
}

impl std::error::Error for TranslateError {}
