use llmux_protocol::{google, openai};

use crate::types::{GoogleChat, TransformMeta, TranslateError};

/// Lower an OpenAI-dialect chat request onto `generateContent`. The model
/// moves into the path, system messages into `systemInstruction`, and
/// consecutive same-role turns merge because Gemini requires user/model
/// alternation.
pub fn request(
    req: openai::ChatCompletionRequest,
    default_max_output: u32,
) -> Result<GoogleChat, TranslateError> {
    let mut system_parts: Vec<google::Part> = Vec::new();
    let mut contents: Vec<google::Content> = Vec::new();

    for message in &req.messages {
        let parts = parts_of(&message.content)?;
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                system_parts.extend(parts);
            }
            openai::ChatRole::User | openai::ChatRole::Tool => {
                append_content(&mut contents, google::ContentRole::User, parts);
            }
            openai::ChatRole::Assistant => {
                append_content(&mut contents, google::ContentRole::Model, parts);
            }
        }
    }

    if contents.is_empty() {
        return Err(TranslateError::Schema(
            "at least one user or assistant message is required".to_string(),
        ));
    }

    let body = google::GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| google::Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: Some(google::GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            max_output_tokens: Some(
                req.max_completion_tokens
                    .or(req.max_tokens)
                    .unwrap_or(default_max_output),
            ),
            stop_sequences: req.stop.map(openai::StopSequences::into_vec),
            candidate_count: req.n,
        }),
        safety_settings: None,
    };

    Ok(GoogleChat {
        model: req.model,
        stream: req.stream.unwrap_or(false),
        body,
    })
}

fn append_content(
    contents: &mut Vec<google::Content>,
    role: google::ContentRole,
    parts: Vec<google::Part>,
) {
    if let Some(last) = contents.last_mut()
        && last.role == Some(role)
    {
        last.parts.extend(parts);
        return;
    }
    contents.push(google::Content {
        role: Some(role),
        parts,
    });
}

fn parts_of(content: &openai::MessageContent) -> Result<Vec<google::Part>, TranslateError> {
    match content {
        openai::MessageContent::Text(text) => Ok(vec![google::Part::Text(text.clone())]),
        openai::MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => Ok(google::Part::Text(text.clone())),
                openai::ContentPart::ImageUrl { image_url } => inline_part(&image_url.url),
            })
            .collect(),
    }
}

fn inline_part(url: &str) -> Result<google::Part, TranslateError> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Ok(google::Part::Text("[image omitted]".to_string()));
    };
    let (mime_type, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| TranslateError::Schema("image data url is not base64".to_string()))?;
    Ok(google::Part::InlineData(google::Blob {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    }))
}

/// Raise a `generateContent` response into the OpenAI chat shape.
pub fn response(
    resp: google::GenerateContentResponse,
    meta: &TransformMeta,
) -> openai::ChatCompletionResponse {
    let candidate = resp.candidates.into_iter().next();
    let text = candidate
        .as_ref()
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
        .unwrap_or_default();

    openai::ChatCompletionResponse {
        id: meta.completion_id(),
        object: openai::ChatCompletionObject::ChatCompletion,
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::ResponseMessage {
                role: openai::ChatRole::Assistant,
                content: Some(text),
                reasoning_content: None,
            },
            finish_reason: candidate
                .and_then(|candidate| candidate.finish_reason)
                .map(finish_reason),
        }],
        usage: resp
            .usage_metadata
            .map(|usage| openai::Usage::new(usage.prompt_token_count, usage.candidates_token_count)),
    }
}

pub fn finish_reason(finish: google::FinishReason) -> openai::FinishReason {
    match finish {
        google::FinishReason::Stop => openai::FinishReason::Stop,
        google::FinishReason::MaxTokens => openai::FinishReason::Length,
        google::FinishReason::Safety | google::FinishReason::Recitation => {
            openai::FinishReason::ContentFilter
        }
        google::FinishReason::Other => openai::FinishReason::Stop,
    }
}
