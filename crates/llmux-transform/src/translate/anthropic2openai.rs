use llmux_protocol::{anthropic, openai};

use crate::types::TransformMeta;

/// Lower a Messages API request onto the OpenAI chat shape. Content
/// blocks flatten to text; the system prompt becomes a leading system
/// message.
pub fn request(req: anthropic::MessagesRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        let text = system.flattened_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::System,
                content: openai::MessageContent::Text(text),
                name: None,
            });
        }
    }
    for message in &req.messages {
        messages.push(openai::ChatMessage {
            role: match message.role {
                anthropic::MessageRole::User => openai::ChatRole::User,
                anthropic::MessageRole::Assistant => openai::ChatRole::Assistant,
            },
            content: openai::MessageContent::Text(message.content.flattened_text()),
            name: None,
        });
    }

    openai::ChatCompletionRequest {
        model: req.model,
        messages,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        frequency_penalty: None,
        presence_penalty: None,
        stop: req.stop_sequences.map(openai::StopSequences::Many),
        stream: req.stream,
        stream_options: None,
        n: None,
        seed: None,
        logit_bias: None,
        user: None,
    }
}

/// Raise an OpenAI chat response into the Messages API shape.
pub fn response(
    resp: openai::ChatCompletionResponse,
    meta: &TransformMeta,
) -> anthropic::MessagesResponse {
    let choice = resp.choices.into_iter().next();
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = choice {
        if let Some(reasoning) = choice.message.reasoning_content {
            content.push(anthropic::ContentBlock::Thinking {
                thinking: reasoning,
            });
        }
        if let Some(text) = choice.message.content {
            content.push(anthropic::ContentBlock::Text { text });
        }
        stop_reason = choice.finish_reason.map(stop_reason_of);
    }

    anthropic::MessagesResponse {
        id: meta.message_id(),
        response_type: "message".to_string(),
        role: anthropic::MessageRole::Assistant,
        model: meta.model.clone(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: resp
            .usage
            .map(|usage| anthropic::MessagesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
    }
}

pub fn stop_reason_of(finish: openai::FinishReason) -> anthropic::StopReason {
    match finish {
        openai::FinishReason::Stop => anthropic::StopReason::EndTurn,
        openai::FinishReason::Length => anthropic::StopReason::MaxTokens,
        openai::FinishReason::ToolCalls => anthropic::StopReason::ToolUse,
        openai::FinishReason::ContentFilter => anthropic::StopReason::Refusal,
    }
}
