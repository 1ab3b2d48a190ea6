use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};

use llmux_common::Service;

use crate::pool::KeyPool;

/// Recheck cadence per service. Providers with volatile quota state are
/// revisited more often.
fn recheck_period(service: Service) -> Duration {
    match service {
        Service::Openai => Duration::from_secs(8 * 3600),
        Service::Anthropic => Duration::from_secs(6 * 3600),
        Service::GoogleAi => Duration::from_secs(3600),
        _ => Duration::from_secs(12 * 3600),
    }
}

/// Deterministic per-host phase so a fleet of proxies does not recheck
/// every credential against the provider at the same instant.
fn host_offset(period: Duration) -> Duration {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "llmux".to_string());
    let digest = Sha256::digest(host.as_bytes());
    let seed = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    Duration::from_secs(seed % period.as_secs().max(1))
}

/// Spawn one recheck job per service that holds keys. Enabled by
/// `CHECK_KEYS`; without it, transient flags only clear on restart.
pub fn spawn_recheckers(pool: Arc<KeyPool>) {
    for service in Service::ALL {
        if pool.list(service).is_empty() {
            continue;
        }
        let pool = pool.clone();
        tokio::spawn(async move {
            let period = recheck_period(service);
            let offset = host_offset(period);
            tokio::time::sleep(offset).await;
            loop {
                let checked = pool.recheck(service);
                tracing::debug!(service = %service, checked, "recheck pass");
                // Small jitter keeps repeated passes decorrelated even
                // when several services share a period.
                let jitter = {
                    let mut rng = rand::rng();
                    Duration::from_secs(rng.random_range(0..=60))
                };
                tokio::time::sleep(period + jitter).await;
            }
        });
    }
}
