use llmux_protocol::{anthropic, openai};

use crate::types::{TransformMeta, TranslateError};

/// Lower an OpenAI-dialect chat request onto `/v1/messages`. System and
/// developer messages are folded into the `system` prompt; consecutive
/// same-role turns merge because the Messages API requires alternation.
pub fn request(
    req: openai::ChatCompletionRequest,
    default_max_output: u32,
) -> Result<anthropic::MessagesRequest, TranslateError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<anthropic::Message> = Vec::new();

    for message in &req.messages {
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                system_parts.push(message.content.flattened_text());
            }
            openai::ChatRole::User | openai::ChatRole::Tool => {
                append_turn(
                    &mut messages,
                    anthropic::MessageRole::User,
                    content_blocks(&message.content)?,
                );
            }
            openai::ChatRole::Assistant => {
                append_turn(
                    &mut messages,
                    anthropic::MessageRole::Assistant,
                    content_blocks(&message.content)?,
                );
            }
        }
    }

    if messages.is_empty() {
        return Err(TranslateError::Schema(
            "at least one user or assistant message is required".to_string(),
        ));
    }

    Ok(anthropic::MessagesRequest {
        model: req.model,
        messages,
        max_tokens: req
            .max_completion_tokens
            .or(req.max_tokens)
            .unwrap_or(default_max_output),
        system: Some(anthropic::SystemPrompt::Text(system_parts.join("\n\n"))),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences: req.stop.map(openai::StopSequences::into_vec),
        stream: req.stream,
        metadata: None,
        anthropic_version: None,
    })
}

fn append_turn(
    messages: &mut Vec<anthropic::Message>,
    role: anthropic::MessageRole,
    blocks: Vec<anthropic::ContentBlock>,
) {
    if let Some(last) = messages.last_mut()
        && last.role == role
    {
        match &mut last.content {
            anthropic::MessageContent::Blocks(existing) => existing.extend(blocks),
            anthropic::MessageContent::Text(text) => {
                let mut merged = vec![anthropic::ContentBlock::Text { text: text.clone() }];
                merged.extend(blocks);
                last.content = anthropic::MessageContent::Blocks(merged);
            }
        }
        return;
    }
    messages.push(anthropic::Message {
        role,
        content: anthropic::MessageContent::Blocks(blocks),
    });
}

fn content_blocks(
    content: &openai::MessageContent,
) -> Result<Vec<anthropic::ContentBlock>, TranslateError> {
    match content {
        openai::MessageContent::Text(text) => {
            Ok(vec![anthropic::ContentBlock::Text { text: text.clone() }])
        }
        openai::MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => {
                    Ok(anthropic::ContentBlock::Text { text: text.clone() })
                }
                openai::ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect(),
    }
}

/// Inline `data:` URLs become base64 image blocks; remote URLs cannot be
/// forwarded to the Messages API and degrade to a text marker.
fn image_block(url: &str) -> Result<anthropic::ContentBlock, TranslateError> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Ok(anthropic::ContentBlock::Text {
            text: "[image omitted]".to_string(),
        });
    };
    let (media_type, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| TranslateError::Schema("image data url is not base64".to_string()))?;
    Ok(anthropic::ContentBlock::Image {
        source: anthropic::ImageSource {
            source_type: "base64".to_string(),
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
    })
}

/// Raise a Messages API response back into the OpenAI chat shape.
pub fn response(
    resp: anthropic::MessagesResponse,
    meta: &TransformMeta,
) -> openai::ChatCompletionResponse {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    for block in &resp.content {
        match block {
            anthropic::ContentBlock::Text { text } => text_parts.push(text.as_str()),
            anthropic::ContentBlock::Thinking { thinking } => {
                thinking_parts.push(thinking.as_str())
            }
            anthropic::ContentBlock::Image { .. } => {}
        }
    }

    openai::ChatCompletionResponse {
        id: meta.completion_id(),
        object: openai::ChatCompletionObject::ChatCompletion,
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::ResponseMessage {
                role: openai::ChatRole::Assistant,
                content: Some(text_parts.join("")),
                reasoning_content: (!thinking_parts.is_empty())
                    .then(|| thinking_parts.join("")),
            },
            finish_reason: resp.stop_reason.map(finish_reason),
        }],
        usage: Some(openai::Usage::new(
            resp.usage.input_tokens,
            resp.usage.output_tokens,
        )),
    }
}

pub fn finish_reason(stop: anthropic::StopReason) -> openai::FinishReason {
    match stop {
        anthropic::StopReason::EndTurn | anthropic::StopReason::StopSequence => {
            openai::FinishReason::Stop
        }
        anthropic::StopReason::MaxTokens => openai::FinishReason::Length,
        anthropic::StopReason::ToolUse => openai::FinishReason::ToolCalls,
        anthropic::StopReason::Refusal => openai::FinishReason::ContentFilter,
    }
}
