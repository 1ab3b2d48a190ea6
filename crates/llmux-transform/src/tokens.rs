use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use llmux_common::Dialect;
use llmux_protocol::google;

use crate::types::ChatRequest;

/// Fixed token estimate charged per image attachment; providers bill
/// images in this ballpark and exact accounting is not worth a decode.
pub const IMAGE_TOKEN_ESTIMATE: u32 = 1200;

/// Per-message framing overhead in the OpenAI chat encoding.
const OPENAI_MESSAGE_OVERHEAD: u32 = 4;

/// What the counter recorded, kept on the request for logging.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    pub prompt_tokens: u32,
    pub tokenizer: &'static str,
}

fn o200k() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

fn cl100k() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

fn openai_bpe(model: &str) -> (Option<&'static CoreBPE>, &'static str) {
    if model.starts_with("gpt-4o")
        || model.starts_with("gpt-4.1")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("chatgpt-4o")
    {
        (o200k(), "o200k_base")
    } else {
        (cl100k(), "cl100k_base")
    }
}

fn bpe_count(bpe: Option<&CoreBPE>, text: &str) -> u32 {
    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        // BPE data unavailable: fall back to the character approximation
        // rather than undercounting to zero.
        None => approx_tokens(text),
    }
}

/// Characters-per-token approximation used for dialects without a local
/// BPE. Empty text is zero; adding characters never lowers the count.
fn approx_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

fn anthropic_approx(text: &str) -> u32 {
    // Claude tokenizes slightly denser than 4 chars/token on prose.
    ((text.chars().count() as u64 * 2).div_ceil(7)) as u32
}

/// Count prompt tokens for a fully-transformed request in its upstream
/// dialect.
pub fn count_prompt_tokens(req: &ChatRequest) -> TokenizerInfo {
    let images = req.image_count() as u32;
    let (text_tokens, tokenizer) = match req {
        ChatRequest::OpenAi(body) => {
            let (bpe, name) = openai_bpe(&body.model);
            let mut total = 0u32;
            for message in &body.messages {
                total += OPENAI_MESSAGE_OVERHEAD;
                total += bpe_count(bpe, &message.content.flattened_text());
            }
            if !body.messages.is_empty() {
                // Reply priming tokens.
                total += 3;
            }
            (total, name)
        }
        ChatRequest::Anthropic(body) => {
            let mut total = 0u32;
            if let Some(system) = &body.system {
                total += anthropic_approx(&system.flattened_text());
            }
            for message in &body.messages {
                total += anthropic_approx(&message.content.flattened_text());
                total += 5;
            }
            (total, "anthropic-approx")
        }
        ChatRequest::Google(body) => {
            let mut total = 0u32;
            if let Some(system) = &body.body.system_instruction {
                total += approx_tokens(&flatten_google(system));
            }
            for content in &body.body.contents {
                total += approx_tokens(&flatten_google(content));
            }
            (total, "google-approx")
        }
        ChatRequest::Mistral(body) => {
            let mut total = 0u32;
            for message in &body.messages {
                total += OPENAI_MESSAGE_OVERHEAD;
                total += approx_tokens(&message.content.flattened_text());
            }
            (total, "mistral-approx")
        }
    };

    TokenizerInfo {
        prompt_tokens: text_tokens + images * IMAGE_TOKEN_ESTIMATE,
        tokenizer,
    }
}

fn flatten_google(content: &google::Content) -> String {
    content
        .parts
        .iter()
        .filter_map(|part| match part {
            google::Part::Text(text) => Some(text.as_str()),
            google::Part::InlineData(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Recount completion tokens from the actual response text; used by
/// postprocess to override the admission-time estimate.
pub fn count_completion_tokens(dialect: Dialect, model: &str, text: &str) -> u32 {
    match dialect {
        Dialect::Openai => {
            let (bpe, _) = openai_bpe(model);
            bpe_count(bpe, text)
        }
        Dialect::Anthropic => anthropic_approx(text),
        Dialect::GoogleAi | Dialect::Mistral => approx_tokens(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_protocol::openai;
    use llmux_protocol::openai::{ChatMessage, ChatRole, MessageContent};

    fn openai_req(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest::OpenAi(openai::ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            stream: None,
            stream_options: None,
            n: None,
            seed: None,
            logit_bias: None,
            user: None,
        })
    }

    fn user_text(text: &str) -> ChatMessage {
        ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Text(text.to_string()),
            name: None,
        }
    }

    #[test]
    fn empty_prompt_counts_zero() {
        let info = count_prompt_tokens(&openai_req(Vec::new()));
        assert_eq!(info.prompt_tokens, 0);
    }

    #[test]
    fn adding_content_never_decreases_count() {
        let short = count_prompt_tokens(&openai_req(vec![user_text("hello")]));
        let long = count_prompt_tokens(&openai_req(vec![
            user_text("hello"),
            user_text("hello again with considerably more text"),
        ]));
        assert!(long.prompt_tokens >= short.prompt_tokens);
    }

    #[test]
    fn images_cost_a_fixed_estimate() {
        use llmux_protocol::openai::{ContentPart, ImageUrl};
        let with_image = openai_req(vec![ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                    detail: None,
                },
            }]),
            name: None,
        }]);
        let info = count_prompt_tokens(&with_image);
        assert!(info.prompt_tokens >= IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn anthropic_approx_is_monotonic_from_zero() {
        assert_eq!(anthropic_approx(""), 0);
        assert!(anthropic_approx("abc") <= anthropic_approx("abcdef"));
    }
}
