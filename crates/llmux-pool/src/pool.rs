use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio::time::Instant;

use llmux_common::{ModelFamily, Service, default_family, resolve_family, service_families};

use crate::events::{EventHub, PoolEvent};
use crate::record::{
    AwsLoggingStatus, DisableReason, FamilyUsage, KeyHash, KeyPatch, KeyRecord, ServiceKeyExtra,
};

/// Window reserved after every `get` so the dispatcher cannot flood one key
/// before the in-flight request's fate is known.
pub const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);

/// Default lockout applied by `mark_rate_limited`.
pub const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoKeysAvailable {
    pub service: Service,
    pub family: ModelFamily,
}

impl std::fmt::Display for NoKeysAvailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no keys available for {}/{}", self.service, self.family)
    }
}

impl std::error::Error for NoKeysAvailable {}

/// What the dispatcher learns about a partition's key situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutPeriod {
    /// At least one key is dispatchable right now.
    Ready,
    /// Every owning key is locked out; the smallest pending window.
    Wait(Duration),
    /// No key owns this family; dispatch must refuse.
    NoKeys,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub reuse_delay: Duration,
    pub rate_limit_lockout: Duration,
    /// Services whose upstreams document longer rate-limit windows.
    pub lockout_overrides: Vec<(Service, Duration)>,
    pub allow_aws_logging: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reuse_delay: KEY_REUSE_DELAY,
            rate_limit_lockout: RATE_LIMIT_LOCKOUT,
            lockout_overrides: vec![
                (Service::Cohere, Duration::from_millis(5000)),
                (Service::Moonshot, Duration::from_millis(3000)),
            ],
            allow_aws_logging: false,
        }
    }
}

impl PoolConfig {
    fn lockout_for(&self, service: Service) -> Duration {
        self.lockout_overrides
            .iter()
            .find(|(svc, _)| *svc == service)
            .map(|(_, window)| *window)
            .unwrap_or(self.rate_limit_lockout)
    }
}

/// Process-wide credential pool: one registry per service, each guarded by
/// its own lock so mutations serialize per service. Constructed once at
/// startup and threaded through request handlers.
pub struct KeyPool {
    registries: BTreeMap<Service, Mutex<BTreeMap<KeyHash, KeyRecord>>>,
    config: PoolConfig,
    events: EventHub,
    changed: Arc<Notify>,
}

impl KeyPool {
    pub fn new(config: PoolConfig, events: EventHub) -> Self {
        let registries = Service::ALL
            .into_iter()
            .map(|service| (service, Mutex::new(BTreeMap::new())))
            .collect();
        Self {
            registries,
            config,
            events,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Fires on every key-state change; the dispatcher waits on this.
    pub fn change_notify(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Register credentials from one service's env list. Structured
    /// secrets (AWS, GCP, Azure) are split on `:` into their parts.
    pub fn insert_secrets(&self, service: Service, secrets: &[String]) {
        let mut registry = self.lock(service);
        for secret in secrets {
            let families: BTreeSet<ModelFamily> =
                service_families(service).iter().copied().collect();
            let mut record = KeyRecord::new(service, secret.clone(), families);
            if let Some(extra) = parse_structured_secret(service, secret) {
                record.extra = extra;
            }
            registry.entry(record.hash.clone()).or_insert(record);
        }
    }

    /// Value copy of the least-recently-used eligible key for `model`.
    ///
    /// On success the underlying record is touched: `last_used := now` and
    /// `rate_limited_until := max(rate_limited_until, now + reuse_delay)`.
    pub fn get(&self, model: &str, service: Service) -> Result<KeyRecord, NoKeysAvailable> {
        let family = resolve_family(service, model).unwrap_or_else(|| default_family(service));
        let now = Instant::now();
        let mut registry = self.lock(service);

        let chosen = registry
            .values()
            .filter(|key| self.eligible(key, family, model, now))
            .min_by(|a, b| a.last_used.cmp(&b.last_used).then(a.hash.cmp(&b.hash)))
            .map(|key| key.hash.clone());

        let Some(hash) = chosen else {
            return Err(NoKeysAvailable { service, family });
        };

        let record = registry.get_mut(&hash).ok_or(NoKeysAvailable { service, family })?;
        record.last_used = Some(now);
        record.prompt_count += 1;
        let reserve_until = now + self.config.reuse_delay;
        record.rate_limited_until = Some(match record.rate_limited_until {
            Some(until) if until > reserve_until => until,
            _ => reserve_until,
        });
        Ok(record.clone())
    }

    pub fn mark_rate_limited(&self, hash: &str) {
        let Some(service) = service_of(hash) else {
            return;
        };
        let lockout = self.config.lockout_for(service);
        {
            let mut registry = self.lock(service);
            let Some(record) = registry.get_mut(hash) else {
                return;
            };
            let now = Instant::now();
            record.rate_limited_at = Some(now);
            record.rate_limited_until = Some(now + lockout);
        }
        self.events.emit(PoolEvent::KeyRateLimited {
            hash: hash.to_string(),
            lockout_ms: lockout.as_millis() as u64,
        });
        self.changed.notify_waiters();
    }

    /// Remove a key from rotation. Revocation is terminal and implies
    /// disabled; quota keeps the credential valid but unusable.
    pub fn disable(&self, hash: &str, reason: DisableReason) {
        let Some(service) = service_of(hash) else {
            return;
        };
        {
            let mut registry = self.lock(service);
            let Some(record) = registry.get_mut(hash) else {
                return;
            };
            record.is_disabled = true;
            match reason {
                DisableReason::Revoked => record.is_revoked = true,
                DisableReason::Quota => record.is_over_quota = true,
            }
        }
        self.events.emit(PoolEvent::KeyDisabled {
            hash: hash.to_string(),
            reason,
        });
        self.changed.notify_waiters();
    }

    /// Idempotent field-wise merge; unknown hashes are ignored.
    pub fn update(&self, hash: &str, patch: &KeyPatch) {
        let Some(service) = service_of(hash) else {
            return;
        };
        {
            let mut registry = self.lock(service);
            let Some(record) = registry.get_mut(hash) else {
                return;
            };
            patch.apply(record);
        }
        self.changed.notify_waiters();
    }

    /// Permanently (until recheck) remove one family from a key.
    pub fn remove_family(&self, hash: &str, family: ModelFamily) {
        let Some(service) = service_of(hash) else {
            return;
        };
        let removed = {
            let mut registry = self.lock(service);
            match registry.get_mut(hash) {
                Some(record) => record.families.remove(&family),
                None => false,
            }
        };
        if removed {
            self.events.emit(PoolEvent::FamilyLost {
                hash: hash.to_string(),
                family,
            });
            self.changed.notify_waiters();
        }
    }

    pub fn increment_usage(&self, hash: &str, family: ModelFamily, input: u64, output: u64) {
        let Some(service) = service_of(hash) else {
            return;
        };
        let mut registry = self.lock(service);
        let Some(record) = registry.get_mut(hash) else {
            return;
        };
        let usage = record.token_usage.entry(family).or_default();
        usage.input += input;
        usage.output += output;
    }

    /// Return token credit after a policy-rejection refund.
    pub fn refund_usage(&self, hash: &str, family: ModelFamily, input: u64, output: u64) {
        let Some(service) = service_of(hash) else {
            return;
        };
        let mut registry = self.lock(service);
        let Some(record) = registry.get_mut(hash) else {
            return;
        };
        let usage = record.token_usage.entry(family).or_default();
        usage.input = usage.input.saturating_sub(input);
        usage.output = usage.output.saturating_sub(output);
    }

    /// Count of keys dispatchable right now for one partition.
    pub fn available(&self, service: Service, family: ModelFamily) -> usize {
        let now = Instant::now();
        let registry = self.lock(service);
        registry
            .values()
            .filter(|key| self.eligible(key, family, "", now))
            .count()
    }

    pub fn available_all(&self) -> usize {
        let now = Instant::now();
        self.registries
            .iter()
            .map(|(_, registry)| {
                let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                registry
                    .values()
                    .filter(|key| !key.is_disabled && !key.rate_limited_now(now))
                    .count()
            })
            .sum()
    }

    /// Smallest pending lockout among keys owning `family`, or `NoKeys`
    /// when no key owns it at all (the dispatcher refuses those).
    pub fn lockout_period(&self, service: Service, family: ModelFamily) -> LockoutPeriod {
        let now = Instant::now();
        let registry = self.lock(service);
        let mut smallest: Option<Duration> = None;
        let mut owners = 0usize;
        for key in registry.values() {
            if key.is_disabled || !key.families.contains(&family) || key.over_quota_for(family) {
                continue;
            }
            owners += 1;
            let pending = key.pending_lockout(now);
            if pending.is_zero() {
                return LockoutPeriod::Ready;
            }
            smallest = Some(match smallest {
                Some(current) if current < pending => current,
                _ => pending,
            });
        }
        match (owners, smallest) {
            (0, _) => LockoutPeriod::NoKeys,
            (_, Some(wait)) => LockoutPeriod::Wait(wait),
            (_, None) => LockoutPeriod::NoKeys,
        }
    }

    /// Value copies of every record in one service, hash order.
    pub fn list(&self, service: Service) -> Vec<KeyRecord> {
        self.lock(service).values().cloned().collect()
    }

    /// Restore transient state for one service's keys. Revoked keys stay
    /// revoked; narrowed family sets and per-family quota flags reset.
    pub fn recheck(&self, service: Service) -> usize {
        let checked_at = SystemTime::now();
        let count = {
            let mut registry = self.lock(service);
            for record in registry.values_mut() {
                if record.is_revoked {
                    continue;
                }
                record.families = record.provisioned_families.clone();
                record.last_checked = Some(checked_at);
                if record.is_over_quota {
                    record.is_over_quota = false;
                    record.is_disabled = false;
                }
                if let ServiceKeyExtra::GoogleAi {
                    over_quota_families, ..
                } = &mut record.extra
                {
                    over_quota_families.clear();
                }
            }
            registry.len()
        };
        self.events.emit(PoolEvent::RecheckCompleted {
            service,
            keys: count,
        });
        self.changed.notify_waiters();
        count
    }

    fn eligible(&self, key: &KeyRecord, family: ModelFamily, model: &str, now: Instant) -> bool {
        if key.is_disabled || key.rate_limited_now(now) {
            return false;
        }
        if !key.families.contains(&family) || key.over_quota_for(family) {
            return false;
        }
        match &key.extra {
            ServiceKeyExtra::Aws {
                model_ids,
                logging_status,
            } => {
                if !model.is_empty() && !model_ids.is_empty() && !model_ids.contains(model) {
                    return false;
                }
                match logging_status {
                    AwsLoggingStatus::Disabled => true,
                    AwsLoggingStatus::Enabled | AwsLoggingStatus::Unknown => {
                        self.config.allow_aws_logging
                    }
                }
            }
            ServiceKeyExtra::GoogleAi { model_ids, .. } => {
                model.is_empty() || model_ids.is_empty() || model_ids.contains(model)
            }
            _ => true,
        }
    }

    fn lock(&self, service: Service) -> std::sync::MutexGuard<'_, BTreeMap<KeyHash, KeyRecord>> {
        // Registries exist for every service from construction.
        self.registries[&service]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Aggregated per-family view for the info endpoint.
#[derive(Debug, Clone, Default)]
pub struct FamilyStats {
    pub active_keys: usize,
    pub revoked_keys: usize,
    pub over_quota_keys: usize,
    pub usage: FamilyUsage,
}

impl KeyPool {
    pub fn family_stats(&self) -> BTreeMap<ModelFamily, FamilyStats> {
        let now = Instant::now();
        let mut stats: BTreeMap<ModelFamily, FamilyStats> = BTreeMap::new();
        for service in Service::ALL {
            let registry = self.lock(service);
            for key in registry.values() {
                for family in &key.provisioned_families {
                    let entry = stats.entry(*family).or_default();
                    if key.is_revoked {
                        entry.revoked_keys += 1;
                    } else if key.is_over_quota || key.over_quota_for(*family) {
                        entry.over_quota_keys += 1;
                    } else if !key.is_disabled && !key.rate_limited_now(now) {
                        entry.active_keys += 1;
                    }
                    if let Some(usage) = key.token_usage.get(family) {
                        entry.usage.input += usage.input;
                        entry.usage.output += usage.output;
                    }
                }
            }
        }
        stats
    }
}

fn service_of(hash: &str) -> Option<Service> {
    let slug = hash.rsplit_once('-').map(|(prefix, _)| prefix)?;
    Service::from_slug(slug)
}

fn parse_structured_secret(service: Service, secret: &str) -> Option<ServiceKeyExtra> {
    let parts: Vec<&str> = secret.split(':').collect();
    match service {
        // accessKeyId:secretAccessKey:region
        Service::Aws if parts.len() >= 3 => Some(ServiceKeyExtra::Aws {
            model_ids: BTreeSet::new(),
            logging_status: AwsLoggingStatus::Unknown,
        }),
        // projectId:region:clientEmail:privateKey
        Service::Gcp if parts.len() >= 4 => Some(ServiceKeyExtra::Gcp {
            project_id: parts[0].to_string(),
            region: parts[1].to_string(),
            client_email: parts[2].to_string(),
            private_key: parts[3..].join(":"),
        }),
        _ => None,
    }
}
