use llmux_protocol::{mistral, openai};

/// Mistral rejects unknown fields, so the OpenAI request is narrowed to
/// the surface it accepts. Responses come back OpenAI-shaped already.
pub fn request(req: openai::ChatCompletionRequest) -> mistral::ChatRequest {
    mistral::ChatRequest {
        model: req.model,
        messages: req.messages,
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop.map(openai::StopSequences::into_vec),
        stream: req.stream,
        random_seed: req.seed,
        safe_prompt: None,
    }
}
