use serde::{Deserialize, Serialize};

/// Concrete wire schema spoken on one side of the proxy.
///
/// AWS and GCP carry the Anthropic dialect upstream; Azure carries the
/// OpenAI dialect with deployment-path rewriting. Deepseek, xAI, Cohere,
/// Qwen and Moonshot expose OpenAI-compatible surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    Openai,
    Anthropic,
    GoogleAi,
    Mistral,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Openai => "openai",
            Dialect::Anthropic => "anthropic",
            Dialect::GoogleAi => "google-ai",
            Dialect::Mistral => "mistral",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    Openai,
    Anthropic,
    GoogleAi,
    MistralAi,
    Aws,
    Gcp,
    Azure,
    Deepseek,
    Xai,
    Cohere,
    Qwen,
    Moonshot,
}

impl Service {
    pub const ALL: [Service; 12] = [
        Service::Openai,
        Service::Anthropic,
        Service::GoogleAi,
        Service::MistralAi,
        Service::Aws,
        Service::Gcp,
        Service::Azure,
        Service::Deepseek,
        Service::Xai,
        Service::Cohere,
        Service::Qwen,
        Service::Moonshot,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Service::Openai => "openai",
            Service::Anthropic => "anthropic",
            Service::GoogleAi => "google-ai",
            Service::MistralAi => "mistral-ai",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::Azure => "azure",
            Service::Deepseek => "deepseek",
            Service::Xai => "xai",
            Service::Cohere => "cohere",
            Service::Qwen => "qwen",
            Service::Moonshot => "moonshot",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Service> {
        Service::ALL.into_iter().find(|svc| svc.slug() == slug)
    }

    /// The dialect the upstream endpoint expects.
    pub fn dialect(self) -> Dialect {
        match self {
            Service::Openai
            | Service::Azure
            | Service::Deepseek
            | Service::Xai
            | Service::Cohere
            | Service::Qwen
            | Service::Moonshot => Dialect::Openai,
            Service::Anthropic | Service::Aws | Service::Gcp => Dialect::Anthropic,
            Service::GoogleAi => Dialect::GoogleAi,
            Service::MistralAi => Dialect::Mistral,
        }
    }

    /// Canonical upstream base URL; config may override per service.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Service::Openai => "https://api.openai.com",
            Service::Anthropic => "https://api.anthropic.com",
            Service::GoogleAi => "https://generativelanguage.googleapis.com",
            Service::MistralAi => "https://api.mistral.ai",
            // Region is spliced into the host at sign time.
            Service::Aws => "https://bedrock-runtime.{region}.amazonaws.com",
            Service::Gcp => "https://{region}-aiplatform.googleapis.com",
            // Azure keys carry their own resource endpoint.
            Service::Azure => "https://{resource}.openai.azure.com",
            Service::Deepseek => "https://api.deepseek.com",
            Service::Xai => "https://api.x.ai",
            Service::Cohere => "https://api.cohere.ai",
            Service::Qwen => "https://dashscope-intl.aliyuncs.com/compatible-mode",
            Service::Moonshot => "https://api.moonshot.ai",
        }
    }

    /// Environment variable holding this service's comma-separated credentials.
    pub fn key_env_var(self) -> &'static str {
        match self {
            Service::Openai => "OPENAI_KEY",
            Service::Anthropic => "ANTHROPIC_KEY",
            Service::GoogleAi => "GOOGLE_AI_KEY",
            Service::MistralAi => "MISTRAL_AI_KEY",
            Service::Aws => "AWS_CREDENTIALS",
            Service::Gcp => "GCP_CREDENTIALS",
            Service::Azure => "AZURE_CREDENTIALS",
            Service::Deepseek => "DEEPSEEK_KEY",
            Service::Xai => "XAI_KEY",
            Service::Cohere => "COHERE_KEY",
            Service::Qwen => "QWEN_KEY",
            Service::Moonshot => "MOONSHOT_KEY",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}
