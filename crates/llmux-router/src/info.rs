use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use serde::Serialize;

use llmux_common::{Service, service_families};
use llmux_core::AppState;
use llmux_queue::PartitionKey;

/// The info document is rebuilt at most this often.
const CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct FamilyInfo {
    active_keys: usize,
    revoked_keys: usize,
    over_quota_keys: usize,
    usage: UsageInfo,
    proompters_in_queue: usize,
    estimated_queue_time_ms: u64,
}

#[derive(Serialize)]
struct UsageInfo {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
}

#[derive(Serialize)]
struct InfoDocument {
    uptime_secs: u64,
    build: &'static str,
    proompts: u64,
    tookens: u64,
    families: std::collections::BTreeMap<String, FamilyInfo>,
}

pub struct InfoCache {
    state: Arc<AppState>,
    cached: Mutex<Option<(Instant, Bytes)>>,
}

impl InfoCache {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            cached: Mutex::new(None),
        })
    }

    fn payload(&self) -> Bytes {
        {
            let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((built_at, payload)) = cached.as_ref()
                && built_at.elapsed() < CACHE_TTL
            {
                return payload.clone();
            }
        }

        let payload = self.build();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some((Instant::now(), payload.clone()));
        payload
    }

    fn build(&self) -> Bytes {
        let state = &self.state;
        let stats = state.pool.family_stats();

        let mut proompts = 0u64;
        for service in Service::ALL {
            for record in state.pool.list(service) {
                proompts += record.prompt_count;
            }
        }

        let mut tookens = 0u64;
        let mut families = std::collections::BTreeMap::new();
        for (family, stat) in &stats {
            let (input_cost, output_cost) = family.token_cost();
            let cost_usd = (stat.usage.input as f64 * input_cost
                + stat.usage.output as f64 * output_cost)
                / 1_000_000.0;
            tookens += stat.usage.input + stat.usage.output;

            let mut queued = 0usize;
            let mut wait = Duration::ZERO;
            for service in Service::ALL {
                if !service_families(service).contains(family) {
                    continue;
                }
                let partition = PartitionKey {
                    service,
                    family: *family,
                };
                queued += state.queue.queued_count(partition);
                wait = wait.max(state.queue.estimated_wait(partition));
            }

            families.insert(
                family.slug().to_string(),
                FamilyInfo {
                    active_keys: stat.active_keys,
                    revoked_keys: stat.revoked_keys,
                    over_quota_keys: stat.over_quota_keys,
                    usage: UsageInfo {
                        input_tokens: stat.usage.input,
                        output_tokens: stat.usage.output,
                        cost_usd,
                    },
                    proompters_in_queue: queued,
                    estimated_queue_time_ms: wait.as_millis() as u64,
                },
            );
        }

        let document = InfoDocument {
            uptime_secs: SystemTime::now()
                .duration_since(state.started_at)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            build: env!("CARGO_PKG_VERSION"),
            proompts,
            tookens,
            families,
        };
        serde_json::to_vec(&document)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{}"))
    }
}

pub fn info_router(state: Arc<AppState>) -> Router {
    let cache = InfoCache::new(state);
    Router::new()
        .route("/", get(serve_info))
        .with_state(cache)
}

async fn serve_info(State(cache): State<Arc<InfoCache>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(cache.payload()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
