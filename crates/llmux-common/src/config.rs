use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::families::ModelFamily;
use crate::service::Service;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("unknown model family in ALLOWED_MODEL_FAMILIES: {0}")]
    UnknownFamily(String),
}

/// Final, merged process configuration. CLI > ENV precedence is applied by
/// clap in the binary; this struct is the read-only result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Credentials per service, exactly as supplied (comma-separated env).
    pub service_keys: Vec<ServiceKeys>,
    /// Enable the periodic credential health checks.
    pub check_keys: bool,
    /// Proxy-wide prompt+output token ceiling for OpenAI-dialect models.
    pub max_context_tokens_openai: u32,
    /// Proxy-wide prompt+output token ceiling for Anthropic-dialect models.
    pub max_context_tokens_anthropic: u32,
    /// When non-empty, families outside this set are invisible and refuse
    /// dispatch.
    pub allowed_model_families: BTreeSet<ModelFamily>,
    /// Dispatch to AWS keys whose logging posture is unconfirmed.
    pub allow_aws_logging: bool,
    /// Ingress geoblock settings, enforced by an external collaborator.
    pub geoblock_enabled: bool,
    pub geoblock_allowed_countries: Vec<String>,
    /// Per-service base URL overrides.
    pub base_url_overrides: Vec<(Service, String)>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            service_keys: Vec::new(),
            check_keys: false,
            max_context_tokens_openai: 128_000,
            max_context_tokens_anthropic: 200_000,
            allowed_model_families: BTreeSet::new(),
            allow_aws_logging: false,
            geoblock_enabled: false,
            geoblock_allowed_countries: Vec::new(),
            base_url_overrides: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Read the enumerated env contract on top of defaults. The binary
    /// overlays CLI flags afterwards.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = GlobalConfig::default();

        for service in Service::ALL {
            if let Ok(raw) = std::env::var(service.key_env_var()) {
                let secrets = split_key_list(&raw);
                if !secrets.is_empty() {
                    config.service_keys.push(ServiceKeys { service, secrets });
                }
            }
        }

        if let Some(value) = env_bool("CHECK_KEYS")? {
            config.check_keys = value;
        }
        if let Some(value) = env_u32("MAX_CONTEXT_TOKENS_OPENAI")? {
            config.max_context_tokens_openai = value;
        }
        if let Some(value) = env_u32("MAX_CONTEXT_TOKENS_ANTHROPIC")? {
            config.max_context_tokens_anthropic = value;
        }
        if let Ok(raw) = std::env::var("ALLOWED_MODEL_FAMILIES") {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let family = ModelFamily::from_slug(part)
                    .ok_or_else(|| ConfigError::UnknownFamily(part.to_string()))?;
                config.allowed_model_families.insert(family);
            }
        }
        if let Some(value) = env_bool("ALLOW_AWS_LOGGING")? {
            config.allow_aws_logging = value;
        }
        if let Some(value) = env_bool("GEOBLOCK_ENABLED")? {
            config.geoblock_enabled = value;
        }
        if let Ok(raw) = std::env::var("GEOBLOCK_ALLOWED_COUNTRIES") {
            config.geoblock_allowed_countries = raw
                .split(',')
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Ok(raw) = std::env::var("PORT")
            && let Ok(port) = raw.trim().parse()
        {
            config.port = port;
        }

        Ok(config)
    }

    pub fn base_url(&self, service: Service) -> &str {
        self.base_url_overrides
            .iter()
            .find(|(svc, _)| *svc == service)
            .map(|(_, url)| url.as_str())
            .unwrap_or_else(|| service.default_base_url())
    }

    pub fn family_visible(&self, family: ModelFamily) -> bool {
        self.allowed_model_families.is_empty() || self.allowed_model_families.contains(&family)
    }

    /// Deployment-wide prompt+output cap for a family's dialect.
    pub fn proxy_max_context(&self, family: ModelFamily) -> u32 {
        match family {
            ModelFamily::Claude
            | ModelFamily::ClaudeOpus
            | ModelFamily::AwsClaude
            | ModelFamily::AwsClaudeOpus
            | ModelFamily::GcpClaude => self.max_context_tokens_anthropic,
            _ => self.max_context_tokens_openai,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceKeys {
    pub service: Service,
    pub secrets: Vec<String>,
}

fn split_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv { var, value: raw }),
        },
        Err(_) => Ok(None),
    }
}

fn env_u32(var: &'static str) -> Result<Option<u32>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_list_splits_and_trims() {
        let keys = split_key_list(" sk-a , sk-b,,sk-c ");
        assert_eq!(keys, vec!["sk-a", "sk-b", "sk-c"]);
    }

    #[test]
    fn family_filter_defaults_to_all_visible() {
        let config = GlobalConfig::default();
        assert!(config.family_visible(ModelFamily::Claude));

        let mut restricted = GlobalConfig::default();
        restricted.allowed_model_families.insert(ModelFamily::Gpt4o);
        assert!(restricted.family_visible(ModelFamily::Gpt4o));
        assert!(!restricted.family_visible(ModelFamily::Claude));
    }
}
