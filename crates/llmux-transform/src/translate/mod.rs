//! Request- and response-body translation, indexed by the Cartesian
//! product of the closed dialect enum. Transforms are pure functions on
//! the validated source schema; unsupported cells return a typed error
//! rather than guessing.

pub mod anthropic2openai;
pub mod openai2anthropic;
pub mod openai2google;
pub mod openai2mistral;

use llmux_common::Dialect;

use crate::types::{ChatRequest, ChatResponse, TransformMeta, TranslateError};

/// Translate a request body between dialects. `default_max_output` fills
/// the completion budget for targets that require one.
pub fn transform_request(
    req: ChatRequest,
    dst: Dialect,
    default_max_output: u32,
) -> Result<ChatRequest, TranslateError> {
    let src = req.dialect();
    if src == dst {
        return Ok(req);
    }
    match (req, dst) {
        (ChatRequest::OpenAi(req), Dialect::Anthropic) => {
            openai2anthropic::request(req, default_max_output).map(ChatRequest::Anthropic)
        }
        (ChatRequest::OpenAi(req), Dialect::GoogleAi) => {
            openai2google::request(req, default_max_output).map(ChatRequest::Google)
        }
        (ChatRequest::OpenAi(req), Dialect::Mistral) => {
            Ok(ChatRequest::Mistral(openai2mistral::request(req)))
        }
        (ChatRequest::Anthropic(req), Dialect::Openai) => {
            Ok(ChatRequest::OpenAi(anthropic2openai::request(req)))
        }
        _ => Err(TranslateError::UnsupportedPair { src, dst }),
    }
}

/// Translate an upstream blocking response into the client's dialect.
/// Synthesized ids derive from `meta`, never from ambient randomness.
pub fn transform_response(
    resp: ChatResponse,
    dst: Dialect,
    meta: &TransformMeta,
) -> Result<ChatResponse, TranslateError> {
    let src = resp.dialect();
    // Mistral responses arrive OpenAI-shaped, so the OpenAI cell covers
    // both sources.
    if src == dst || (src == Dialect::Openai && dst == Dialect::Mistral) {
        return Ok(resp);
    }
    match (resp, dst) {
        (ChatResponse::Anthropic(resp), Dialect::Openai | Dialect::Mistral) => Ok(
            ChatResponse::OpenAi(openai2anthropic::response(resp, meta)),
        ),
        (ChatResponse::Google(resp), Dialect::Openai | Dialect::Mistral) => {
            Ok(ChatResponse::OpenAi(openai2google::response(resp, meta)))
        }
        (ChatResponse::OpenAi(resp), Dialect::Anthropic) => Ok(ChatResponse::Anthropic(
            anthropic2openai::response(resp, meta),
        )),
        (resp, dst) => Err(TranslateError::UnsupportedPair {
            src: resp.dialect(),
            dst,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_protocol::{anthropic, openai};

    fn openai_request() -> openai::ChatCompletionRequest {
        openai::ChatCompletionRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages: vec![
                openai::ChatMessage {
                    role: openai::ChatRole::System,
                    content: openai::MessageContent::Text("be terse".to_string()),
                    name: None,
                },
                openai::ChatMessage {
                    role: openai::ChatRole::User,
                    content: openai::MessageContent::Text("hi".to_string()),
                    name: None,
                },
            ],
            max_tokens: Some(64),
            max_completion_tokens: None,
            temperature: Some(0.7),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            stream: Some(false),
            stream_options: None,
            n: None,
            seed: None,
            logit_bias: None,
            user: None,
        }
    }

    #[test]
    fn openai_to_anthropic_moves_system_out_of_messages() {
        let out = transform_request(
            ChatRequest::OpenAi(openai_request()),
            Dialect::Anthropic,
            8192,
        )
        .unwrap();
        let ChatRequest::Anthropic(req) = out else {
            panic!("expected anthropic request");
        };
        assert_eq!(req.model, "claude-3-5-sonnet-20241022");
        assert_eq!(req.max_tokens, 64);
        assert_eq!(
            req.system.as_ref().map(|s| s.flattened_text()).as_deref(),
            Some("be terse")
        );
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, anthropic::MessageRole::User);
    }

    #[test]
    fn request_round_trip_preserves_semantic_fields() {
        let original = openai_request();
        let there = transform_request(
            ChatRequest::OpenAi(original.clone()),
            Dialect::Anthropic,
            8192,
        )
        .unwrap();
        let ChatRequest::Anthropic(anthropic_req) = there else {
            panic!("expected anthropic request");
        };
        let back = transform_request(ChatRequest::Anthropic(anthropic_req), Dialect::Openai, 8192)
            .unwrap();
        let ChatRequest::OpenAi(req) = back else {
            panic!("expected openai request");
        };

        assert_eq!(req.model, original.model);
        assert_eq!(req.max_tokens, original.max_tokens);
        assert_eq!(req.temperature, original.temperature);
        assert_eq!(req.stream, original.stream);
        // System content survives as a leading system message.
        assert_eq!(req.messages[0].role, openai::ChatRole::System);
        assert_eq!(req.messages[0].content.flattened_text(), "be terse");
        assert_eq!(req.messages[1].content.flattened_text(), "hi");
    }

    #[test]
    fn consecutive_same_role_turns_merge_for_anthropic() {
        let mut req = openai_request();
        req.messages.push(openai::ChatMessage {
            role: openai::ChatRole::User,
            content: openai::MessageContent::Text("second".to_string()),
            name: None,
        });
        let out =
            transform_request(ChatRequest::OpenAi(req), Dialect::Anthropic, 8192).unwrap();
        let ChatRequest::Anthropic(req) = out else {
            panic!("expected anthropic request");
        };
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn openai_to_google_merges_roles_and_sets_budget() {
        let out = transform_request(
            ChatRequest::OpenAi(openai_request()),
            Dialect::GoogleAi,
            2048,
        )
        .unwrap();
        let ChatRequest::Google(req) = out else {
            panic!("expected google request");
        };
        assert!(req.body.system_instruction.is_some());
        assert_eq!(
            req.body
                .generation_config
                .as_ref()
                .and_then(|c| c.max_output_tokens),
            Some(64)
        );
    }

    #[test]
    fn unsupported_pair_is_typed() {
        let anthropic_req = anthropic::MessagesRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages: vec![anthropic::Message {
                role: anthropic::MessageRole::User,
                content: anthropic::MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 16,
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            metadata: None,
            anthropic_version: None,
        };
        let err = transform_request(
            ChatRequest::Anthropic(anthropic_req),
            Dialect::GoogleAi,
            1024,
        )
        .unwrap_err();
        assert!(matches!(err, TranslateError::UnsupportedPair { .. }));
    }

    #[test]
    fn anthropic_response_becomes_openai_completion() {
        let resp = anthropic::MessagesResponse {
            id: "msg_upstream".to_string(),
            response_type: "message".to_string(),
            role: anthropic::MessageRole::Assistant,
            model: "claude-3-5-sonnet-20241022".to_string(),
            content: vec![anthropic::ContentBlock::Text {
                text: "hello".to_string(),
            }],
            stop_reason: Some(anthropic::StopReason::EndTurn),
            stop_sequence: None,
            usage: anthropic::MessagesUsage {
                input_tokens: 10,
                output_tokens: 2,
            },
        };
        let meta = TransformMeta {
            request_id: "abc123".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            created: 1_700_000_000,
        };
        let out = transform_response(ChatResponse::Anthropic(resp), Dialect::Openai, &meta)
            .unwrap();
        let ChatResponse::OpenAi(resp) = out else {
            panic!("expected openai response");
        };
        assert_eq!(resp.id, "chatcmpl-abc123");
        assert_eq!(resp.choices[0].message.role, openai::ChatRole::Assistant);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(
            resp.choices[0].finish_reason,
            Some(openai::FinishReason::Stop)
        );
    }
}
