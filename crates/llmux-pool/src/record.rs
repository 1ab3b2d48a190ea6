use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use llmux_common::{ModelFamily, Service};

pub type KeyHash = String;

/// Derive the opaque external handle for a credential secret. The handle
/// leaks nothing about the secret and is stable across restarts.
pub fn hash_secret(service: Service, secret: &str) -> KeyHash {
    let digest = Sha256::digest(secret.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{}-{hex}", service.slug())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    Quota,
    Revoked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AwsLoggingStatus {
    /// Invocation logging confirmed off.
    Disabled,
    /// Logging confirmed on; dispatch requires ALLOW_AWS_LOGGING.
    Enabled,
    /// Posture not yet checked.
    Unknown,
}

/// Service-specific credential attributes.
#[derive(Debug, Clone)]
pub enum ServiceKeyExtra {
    OpenAi {
        is_trial: bool,
        organization_id: Option<String>,
    },
    Anthropic {
        tier: Option<String>,
        is_pozzed: bool,
        allows_multimodality: bool,
        requires_preamble: bool,
    },
    Aws {
        model_ids: BTreeSet<String>,
        logging_status: AwsLoggingStatus,
    },
    GoogleAi {
        model_ids: BTreeSet<String>,
        over_quota_families: BTreeSet<ModelFamily>,
    },
    Gcp {
        region: String,
        project_id: String,
        client_email: String,
        private_key: String,
    },
    None,
}

impl ServiceKeyExtra {
    pub fn default_for(service: Service) -> Self {
        match service {
            Service::Openai => ServiceKeyExtra::OpenAi {
                is_trial: false,
                organization_id: None,
            },
            Service::Anthropic => ServiceKeyExtra::Anthropic {
                tier: None,
                is_pozzed: false,
                allows_multimodality: true,
                requires_preamble: false,
            },
            Service::Aws => ServiceKeyExtra::Aws {
                model_ids: BTreeSet::new(),
                logging_status: AwsLoggingStatus::Unknown,
            },
            Service::GoogleAi => ServiceKeyExtra::GoogleAi {
                model_ids: BTreeSet::new(),
                over_quota_families: BTreeSet::new(),
            },
            Service::Gcp => ServiceKeyExtra::Gcp {
                region: String::new(),
                project_id: String::new(),
                client_email: String::new(),
                private_key: String::new(),
            },
            _ => ServiceKeyExtra::None,
        }
    }
}

/// One pooled credential. Owned exclusively by its service registry;
/// callers only ever see value copies.
#[derive(Clone)]
pub struct KeyRecord {
    pub hash: KeyHash,
    pub secret: String,
    pub service: Service,
    pub families: BTreeSet<ModelFamily>,
    /// Families assigned at insert; a recheck restores `families` to this.
    pub provisioned_families: BTreeSet<ModelFamily>,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub is_over_quota: bool,
    pub prompt_count: u64,
    pub last_used: Option<Instant>,
    pub last_checked: Option<SystemTime>,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub token_usage: BTreeMap<ModelFamily, FamilyUsage>,
    pub extra: ServiceKeyExtra,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("hash", &self.hash)
            .field("secret", &"<redacted>")
            .field("service", &self.service)
            .field("families", &self.families)
            .field("is_disabled", &self.is_disabled)
            .field("is_revoked", &self.is_revoked)
            .field("is_over_quota", &self.is_over_quota)
            .finish()
    }
}

impl KeyRecord {
    pub fn new(service: Service, secret: String, families: BTreeSet<ModelFamily>) -> Self {
        Self {
            hash: hash_secret(service, &secret),
            secret,
            service,
            provisioned_families: families.clone(),
            families,
            is_disabled: false,
            is_revoked: false,
            is_over_quota: false,
            prompt_count: 0,
            last_used: None,
            last_checked: None,
            rate_limited_at: None,
            rate_limited_until: None,
            token_usage: BTreeMap::new(),
            extra: ServiceKeyExtra::default_for(service),
        }
    }

    pub fn rate_limited_now(&self, now: Instant) -> bool {
        matches!(self.rate_limited_until, Some(until) if until > now)
    }

    /// Time left before this key leaves its rate-limit window.
    pub fn pending_lockout(&self, now: Instant) -> std::time::Duration {
        match self.rate_limited_until {
            Some(until) if until > now => until - now,
            _ => std::time::Duration::ZERO,
        }
    }

    pub fn over_quota_for(&self, family: ModelFamily) -> bool {
        if self.is_over_quota {
            return true;
        }
        match &self.extra {
            ServiceKeyExtra::GoogleAi {
                over_quota_families, ..
            } => over_quota_families.contains(&family),
            _ => false,
        }
    }
}

/// Field-wise merge applied by `KeyPool::update`. Every field is
/// last-writer-wins except the set additions, which are unions; applying
/// the same patch twice leaves the record unchanged.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub families: Option<BTreeSet<ModelFamily>>,
    pub is_over_quota: Option<bool>,
    pub last_checked: Option<SystemTime>,
    pub is_trial: Option<bool>,
    pub organization_id: Option<String>,
    pub tier: Option<String>,
    pub is_pozzed: Option<bool>,
    pub allows_multimodality: Option<bool>,
    pub requires_preamble: Option<bool>,
    pub model_ids: Option<BTreeSet<String>>,
    pub over_quota_families_add: Option<BTreeSet<ModelFamily>>,
    pub logging_status: Option<AwsLoggingStatus>,
}

impl KeyPatch {
    pub fn apply(&self, record: &mut KeyRecord) {
        if let Some(families) = &self.families {
            record.families = families.clone();
        }
        if let Some(flag) = self.is_over_quota {
            record.is_over_quota = flag;
        }
        if let Some(at) = self.last_checked {
            record.last_checked = Some(at);
        }
        match &mut record.extra {
            ServiceKeyExtra::OpenAi {
                is_trial,
                organization_id,
            } => {
                if let Some(flag) = self.is_trial {
                    *is_trial = flag;
                }
                if let Some(org) = &self.organization_id {
                    *organization_id = Some(org.clone());
                }
            }
            ServiceKeyExtra::Anthropic {
                tier,
                is_pozzed,
                allows_multimodality,
                requires_preamble,
            } => {
                if let Some(value) = &self.tier {
                    *tier = Some(value.clone());
                }
                if let Some(flag) = self.is_pozzed {
                    *is_pozzed = flag;
                }
                if let Some(flag) = self.allows_multimodality {
                    *allows_multimodality = flag;
                }
                if let Some(flag) = self.requires_preamble {
                    *requires_preamble = flag;
                }
            }
            ServiceKeyExtra::Aws {
                model_ids,
                logging_status,
            } => {
                if let Some(ids) = &self.model_ids {
                    *model_ids = ids.clone();
                }
                if let Some(status) = self.logging_status {
                    *logging_status = status;
                }
            }
            ServiceKeyExtra::GoogleAi {
                model_ids,
                over_quota_families,
            } => {
                if let Some(ids) = &self.model_ids {
                    *model_ids = ids.clone();
                }
                if let Some(add) = &self.over_quota_families_add {
                    over_quota_families.extend(add.iter().copied());
                }
            }
            ServiceKeyExtra::Gcp { .. } | ServiceKeyExtra::None => {}
        }
    }
}
