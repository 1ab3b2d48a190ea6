use std::sync::Arc;

use llmux_common::{ModelFamily, Service, service_families};
use llmux_core::AppState;
use llmux_protocol::openai::{ModelEntry, ModelList};

/// Representative model ids advertised per family. Listing is cosmetic:
/// admission works on whatever id the client sends.
fn family_models(family: ModelFamily) -> &'static [&'static str] {
    match family {
        ModelFamily::Turbo => &["gpt-3.5-turbo", "gpt-3.5-turbo-0125"],
        ModelFamily::Gpt4 => &["gpt-4", "gpt-4-0613"],
        ModelFamily::Gpt4o => &["gpt-4o", "gpt-4o-mini"],
        ModelFamily::Gpt41 => &["gpt-4.1", "gpt-4.1-mini"],
        ModelFamily::O1 => &["o1", "o1-mini"],
        ModelFamily::Claude | ModelFamily::AwsClaude | ModelFamily::GcpClaude => &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-7-sonnet-20250219",
        ],
        ModelFamily::ClaudeOpus | ModelFamily::AwsClaudeOpus => &["claude-3-opus-20240229"],
        ModelFamily::GeminiFlash => &["gemini-1.5-flash", "gemini-2.0-flash"],
        ModelFamily::GeminiPro => &["gemini-1.5-pro"],
        ModelFamily::GeminiUltra => &["gemini-1.0-ultra"],
        ModelFamily::Mistral => &["mistral-small-2409", "open-mistral-nemo"],
        ModelFamily::MistralLarge => &["mistral-large-2411"],
        ModelFamily::DeepseekChat => &["deepseek-chat"],
        ModelFamily::DeepseekReasoner => &["deepseek-reasoner"],
        ModelFamily::Grok => &["grok-2", "grok-3"],
        ModelFamily::Command => &["command-r-plus", "command-a-03-2025"],
        ModelFamily::Qwen => &["qwen-max", "qwen3-235b-a22b"],
        ModelFamily::Moonshot => &["kimi-k2-0711-preview", "moonshot-v1-128k"],
        ModelFamily::AzureGpt4o => &["gpt-4o"],
    }
}

/// OpenAI-dialect model list for one service: families that are visible
/// and currently have at least one live key.
pub fn models_payload(state: &Arc<AppState>, service: Service) -> ModelList {
    let config = state.config.load();
    let mut data = Vec::new();
    for family in service_families(service) {
        if !config.family_visible(*family) {
            continue;
        }
        if state.pool.available(service, *family) == 0 {
            continue;
        }
        for id in family_models(*family) {
            data.push(ModelEntry {
                id: (*id).to_string(),
                object: "model".to_string(),
                created: 0,
                owned_by: service.slug().to_string(),
            });
        }
    }
    ModelList {
        object: "list".to_string(),
        data,
    }
}
