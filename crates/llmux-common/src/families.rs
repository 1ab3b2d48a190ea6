use serde::{Deserialize, Serialize};

use crate::service::Service;

/// Coarse grouping of models that share billing and rate-limit
/// characteristics. Queue partitions and usage counters key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Turbo,
    Gpt4,
    Gpt4o,
    Gpt41,
    O1,
    Claude,
    ClaudeOpus,
    GeminiFlash,
    GeminiPro,
    GeminiUltra,
    Mistral,
    MistralLarge,
    DeepseekChat,
    DeepseekReasoner,
    Grok,
    Command,
    Qwen,
    Moonshot,
    AwsClaude,
    AwsClaudeOpus,
    GcpClaude,
    AzureGpt4o,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 22] = [
        ModelFamily::Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4o,
        ModelFamily::Gpt41,
        ModelFamily::O1,
        ModelFamily::Claude,
        ModelFamily::ClaudeOpus,
        ModelFamily::GeminiFlash,
        ModelFamily::GeminiPro,
        ModelFamily::GeminiUltra,
        ModelFamily::Mistral,
        ModelFamily::MistralLarge,
        ModelFamily::DeepseekChat,
        ModelFamily::DeepseekReasoner,
        ModelFamily::Grok,
        ModelFamily::Command,
        ModelFamily::Qwen,
        ModelFamily::Moonshot,
        ModelFamily::AwsClaude,
        ModelFamily::AwsClaudeOpus,
        ModelFamily::GcpClaude,
        ModelFamily::AzureGpt4o,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::Gpt41 => "gpt41",
            ModelFamily::O1 => "o1",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
            ModelFamily::GeminiUltra => "gemini-ultra",
            ModelFamily::Mistral => "mistral",
            ModelFamily::MistralLarge => "mistral-large",
            ModelFamily::DeepseekChat => "deepseek-chat",
            ModelFamily::DeepseekReasoner => "deepseek-reasoner",
            ModelFamily::Grok => "grok",
            ModelFamily::Command => "command",
            ModelFamily::Qwen => "qwen",
            ModelFamily::Moonshot => "moonshot",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::AwsClaudeOpus => "aws-claude-opus",
            ModelFamily::GcpClaude => "gcp-claude",
            ModelFamily::AzureGpt4o => "azure-gpt4o",
        }
    }

    pub fn from_slug(slug: &str) -> Option<ModelFamily> {
        ModelFamily::ALL.into_iter().find(|f| f.slug() == slug)
    }

    /// Largest prompt+completion window any model of the family accepts.
    /// Per-model overrides in [`context_window_for`] win over this.
    pub fn context_window(self) -> u32 {
        match self {
            ModelFamily::Turbo => 16_385,
            ModelFamily::Gpt4 => 8_192,
            ModelFamily::Gpt4o | ModelFamily::AzureGpt4o => 128_000,
            ModelFamily::Gpt41 => 1_047_576,
            ModelFamily::O1 => 200_000,
            ModelFamily::Claude
            | ModelFamily::ClaudeOpus
            | ModelFamily::AwsClaude
            | ModelFamily::AwsClaudeOpus
            | ModelFamily::GcpClaude => 200_000,
            ModelFamily::GeminiFlash | ModelFamily::GeminiPro => 1_048_576,
            ModelFamily::GeminiUltra => 32_768,
            ModelFamily::Mistral => 32_768,
            ModelFamily::MistralLarge => 131_072,
            ModelFamily::DeepseekChat | ModelFamily::DeepseekReasoner => 65_536,
            ModelFamily::Grok => 131_072,
            ModelFamily::Command => 128_000,
            ModelFamily::Qwen => 131_072,
            ModelFamily::Moonshot => 131_072,
        }
    }

    /// Output ceiling applied when the client omits `max_tokens`.
    pub fn default_max_output(self) -> u32 {
        match self {
            ModelFamily::Turbo | ModelFamily::Gpt4 => 4_096,
            ModelFamily::O1 => 32_768,
            ModelFamily::DeepseekReasoner => 32_768,
            _ => 8_192,
        }
    }

    /// USD per million tokens, `(input, output)`.
    pub fn token_cost(self) -> (f64, f64) {
        match self {
            ModelFamily::Turbo => (0.5, 1.5),
            ModelFamily::Gpt4 => (30.0, 60.0),
            ModelFamily::Gpt4o | ModelFamily::AzureGpt4o => (2.5, 10.0),
            ModelFamily::Gpt41 => (2.0, 8.0),
            ModelFamily::O1 => (15.0, 60.0),
            ModelFamily::Claude | ModelFamily::AwsClaude | ModelFamily::GcpClaude => (3.0, 15.0),
            ModelFamily::ClaudeOpus | ModelFamily::AwsClaudeOpus => (15.0, 75.0),
            ModelFamily::GeminiFlash => (0.15, 0.6),
            ModelFamily::GeminiPro => (1.25, 10.0),
            ModelFamily::GeminiUltra => (7.0, 21.0),
            ModelFamily::Mistral => (0.7, 2.1),
            ModelFamily::MistralLarge => (2.0, 6.0),
            ModelFamily::DeepseekChat => (0.27, 1.1),
            ModelFamily::DeepseekReasoner => (0.55, 2.19),
            ModelFamily::Grok => (3.0, 15.0),
            ModelFamily::Command => (2.5, 10.0),
            ModelFamily::Qwen => (1.6, 6.4),
            ModelFamily::Moonshot => (2.0, 5.0),
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

struct FamilyRule {
    matches: fn(&str) -> bool,
    family: ModelFamily,
}

/// Ordered resolution rules, most specific first. The first matching rule
/// wins, so `gpt-4o` must be tested before `gpt-4`.
const OPENAI_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4"), family: ModelFamily::O1 },
    FamilyRule { matches: |m| m.starts_with("gpt-4.1"), family: ModelFamily::Gpt41 },
    FamilyRule { matches: |m| m.starts_with("gpt-4o") || m.starts_with("chatgpt-4o"), family: ModelFamily::Gpt4o },
    FamilyRule { matches: |m| m.starts_with("gpt-4"), family: ModelFamily::Gpt4 },
    FamilyRule { matches: |m| m.starts_with("gpt-3.5"), family: ModelFamily::Turbo },
];

const ANTHROPIC_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("claude") && m.contains("opus"), family: ModelFamily::ClaudeOpus },
    FamilyRule { matches: |m| m.starts_with("claude"), family: ModelFamily::Claude },
];

const GOOGLE_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("gemini") && m.contains("flash"), family: ModelFamily::GeminiFlash },
    FamilyRule { matches: |m| m.starts_with("gemini") && m.contains("ultra"), family: ModelFamily::GeminiUltra },
    FamilyRule { matches: |m| m.starts_with("gemini"), family: ModelFamily::GeminiPro },
];

const MISTRAL_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.contains("mistral-large") || m.contains("mixtral"), family: ModelFamily::MistralLarge },
    FamilyRule { matches: |m| m.starts_with("mistral") || m.starts_with("open-mistral") || m.starts_with("codestral") || m.starts_with("ministral"), family: ModelFamily::Mistral },
];

const AWS_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.contains("claude") && m.contains("opus"), family: ModelFamily::AwsClaudeOpus },
    FamilyRule { matches: |m| m.contains("claude"), family: ModelFamily::AwsClaude },
];

const GCP_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.contains("claude"), family: ModelFamily::GcpClaude },
];

const DEEPSEEK_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.contains("reasoner") || m.contains("-r1"), family: ModelFamily::DeepseekReasoner },
    FamilyRule { matches: |m| m.starts_with("deepseek"), family: ModelFamily::DeepseekChat },
];

const XAI_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("grok"), family: ModelFamily::Grok },
];

const COHERE_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("command"), family: ModelFamily::Command },
];

const QWEN_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("qwen"), family: ModelFamily::Qwen },
];

const MOONSHOT_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("moonshot") || m.starts_with("kimi"), family: ModelFamily::Moonshot },
];

const AZURE_RULES: &[FamilyRule] = &[
    FamilyRule { matches: |m| m.starts_with("gpt-4o"), family: ModelFamily::AzureGpt4o },
    FamilyRule { matches: |m| m.starts_with("gpt-4.1"), family: ModelFamily::Gpt41 },
    FamilyRule { matches: |m| m.starts_with("gpt-4"), family: ModelFamily::Gpt4 },
    FamilyRule { matches: |m| m.starts_with("gpt-3.5"), family: ModelFamily::Turbo },
];

fn rules_for(service: Service) -> &'static [FamilyRule] {
    match service {
        Service::Openai => OPENAI_RULES,
        Service::Anthropic => ANTHROPIC_RULES,
        Service::GoogleAi => GOOGLE_RULES,
        Service::MistralAi => MISTRAL_RULES,
        Service::Aws => AWS_RULES,
        Service::Gcp => GCP_RULES,
        Service::Azure => AZURE_RULES,
        Service::Deepseek => DEEPSEEK_RULES,
        Service::Xai => XAI_RULES,
        Service::Cohere => COHERE_RULES,
        Service::Qwen => QWEN_RULES,
        Service::Moonshot => MOONSHOT_RULES,
    }
}

/// Resolve a normalized model id to its family within one service.
pub fn resolve_family(service: Service, model: &str) -> Option<ModelFamily> {
    let model = model.strip_prefix("models/").unwrap_or(model);
    rules_for(service)
        .iter()
        .find(|rule| (rule.matches)(model))
        .map(|rule| rule.family)
}

/// Fallback family when a service sees an id no rule recognizes.
pub fn default_family(service: Service) -> ModelFamily {
    match service {
        Service::Openai => ModelFamily::Gpt4o,
        Service::Anthropic => ModelFamily::Claude,
        Service::GoogleAi => ModelFamily::GeminiPro,
        Service::MistralAi => ModelFamily::Mistral,
        Service::Aws => ModelFamily::AwsClaude,
        Service::Gcp => ModelFamily::GcpClaude,
        Service::Azure => ModelFamily::AzureGpt4o,
        Service::Deepseek => ModelFamily::DeepseekChat,
        Service::Xai => ModelFamily::Grok,
        Service::Cohere => ModelFamily::Command,
        Service::Qwen => ModelFamily::Qwen,
        Service::Moonshot => ModelFamily::Moonshot,
    }
}

/// Families a freshly provisioned credential of this service may serve.
pub fn service_families(service: Service) -> &'static [ModelFamily] {
    match service {
        Service::Openai => &[
            ModelFamily::Turbo,
            ModelFamily::Gpt4,
            ModelFamily::Gpt4o,
            ModelFamily::Gpt41,
            ModelFamily::O1,
        ],
        Service::Anthropic => &[ModelFamily::Claude, ModelFamily::ClaudeOpus],
        Service::GoogleAi => &[
            ModelFamily::GeminiFlash,
            ModelFamily::GeminiPro,
            ModelFamily::GeminiUltra,
        ],
        Service::MistralAi => &[ModelFamily::Mistral, ModelFamily::MistralLarge],
        Service::Aws => &[ModelFamily::AwsClaude, ModelFamily::AwsClaudeOpus],
        Service::Gcp => &[ModelFamily::GcpClaude],
        Service::Azure => &[
            ModelFamily::AzureGpt4o,
            ModelFamily::Gpt41,
            ModelFamily::Gpt4,
            ModelFamily::Turbo,
        ],
        Service::Deepseek => &[ModelFamily::DeepseekChat, ModelFamily::DeepseekReasoner],
        Service::Xai => &[ModelFamily::Grok],
        Service::Cohere => &[ModelFamily::Command],
        Service::Qwen => &[ModelFamily::Qwen],
        Service::Moonshot => &[ModelFamily::Moonshot],
    }
}

/// Per-model context window overrides. The family table is the fallback.
pub fn context_window_for(model: &str, family: ModelFamily) -> u32 {
    match model {
        "gpt-3.5-turbo-instruct" => 4_096,
        "gpt-4-32k" | "gpt-4-32k-0613" => 32_768,
        "claude-2.0" | "claude-instant-1.2" => 100_000,
        "gemini-1.0-pro" => 32_768,
        "deepseek-chat" => 65_536,
        _ => family.context_window(),
    }
}

/// Dated canonical ids for `-latest` aliases and loose client names.
/// Deterministic and purely a function of the input string.
pub fn normalize_model(service: Service, model: &str) -> String {
    let model = model.strip_prefix("models/").unwrap_or(model);
    let canonical = match model {
        "claude-3-5-sonnet-latest" | "claude-3.5-sonnet-latest" | "claude-3.5-sonnet" => {
            "claude-3-5-sonnet-20241022"
        }
        "claude-3-5-haiku-latest" | "claude-3.5-haiku" => "claude-3-5-haiku-20241022",
        "claude-3-7-sonnet-latest" | "claude-3.7-sonnet" => "claude-3-7-sonnet-20250219",
        "claude-3-opus-latest" => "claude-3-opus-20240229",
        "gemini-pro" => "gemini-1.5-pro",
        "gemini-flash" => "gemini-1.5-flash",
        "mistral-large-latest" => "mistral-large-2411",
        "mistral-small-latest" => "mistral-small-2409",
        other => other,
    };
    // AWS model ids carry the vendor prefix.
    if service == Service::Aws && canonical.starts_with("claude") {
        return format!("anthropic.{canonical}-v1:0");
    }
    canonical.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_order_prefers_specific_prefixes() {
        assert_eq!(
            resolve_family(Service::Openai, "gpt-4o-mini"),
            Some(ModelFamily::Gpt4o)
        );
        assert_eq!(
            resolve_family(Service::Openai, "gpt-4-0613"),
            Some(ModelFamily::Gpt4)
        );
        assert_eq!(
            resolve_family(Service::Openai, "gpt-4.1-nano"),
            Some(ModelFamily::Gpt41)
        );
    }

    #[test]
    fn google_families_split_on_variant() {
        assert_eq!(
            resolve_family(Service::GoogleAi, "gemini-1.5-flash-8b"),
            Some(ModelFamily::GeminiFlash)
        );
        assert_eq!(
            resolve_family(Service::GoogleAi, "models/gemini-1.5-pro"),
            Some(ModelFamily::GeminiPro)
        );
    }

    #[test]
    fn unknown_model_has_no_family() {
        assert_eq!(resolve_family(Service::Openai, "llama-3-70b"), None);
    }

    #[test]
    fn latest_alias_maps_to_dated_id() {
        assert_eq!(
            normalize_model(Service::Anthropic, "claude-3-5-sonnet-latest"),
            "claude-3-5-sonnet-20241022"
        );
        assert_eq!(
            normalize_model(Service::GoogleAi, "models/gemini-pro"),
            "gemini-1.5-pro"
        );
    }

    #[test]
    fn aws_normalization_adds_vendor_prefix() {
        assert_eq!(
            normalize_model(Service::Aws, "claude-3-5-sonnet-latest"),
            "anthropic.claude-3-5-sonnet-20241022-v1:0"
        );
    }

    #[test]
    fn per_model_window_overrides_family() {
        assert_eq!(context_window_for("gpt-4-32k", ModelFamily::Gpt4), 32_768);
        assert_eq!(
            context_window_for("gpt-4-0613", ModelFamily::Gpt4),
            ModelFamily::Gpt4.context_window()
        );
    }
}
