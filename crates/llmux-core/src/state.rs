use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;

use llmux_common::GlobalConfig;
use llmux_pool::{EventHub, KeyPool, PoolConfig, TracingEventSink};
use llmux_queue::AdmissionQueue;

use crate::client::UpstreamClient;
use crate::sign::gcp::GcpTokenBroker;
use crate::users::{NoopUserStore, UserStore};

/// Process-wide state, constructed once at startup and threaded through
/// request handlers. The key pool and the admission queue live here and
/// nowhere else.
pub struct AppState {
    pub config: ArcSwap<GlobalConfig>,
    pub pool: Arc<KeyPool>,
    pub queue: Arc<AdmissionQueue>,
    pub client: Arc<dyn UpstreamClient>,
    pub users: Arc<dyn UserStore>,
    pub gcp_tokens: GcpTokenBroker,
    pub started_at: SystemTime,
}

impl AppState {
    pub async fn new(config: GlobalConfig, client: Arc<dyn UpstreamClient>) -> Arc<Self> {
        Self::with_user_store(config, client, Arc::new(NoopUserStore)).await
    }

    /// Construct with a real accounting collaborator instead of the
    /// default no-op recorder.
    pub async fn with_user_store(
        config: GlobalConfig,
        client: Arc<dyn UpstreamClient>,
        users: Arc<dyn UserStore>,
    ) -> Arc<Self> {
        let events = EventHub::new(1024);
        events.add_sink(Arc::new(TracingEventSink)).await;

        let pool_config = PoolConfig {
            allow_aws_logging: config.allow_aws_logging,
            ..PoolConfig::default()
        };
        let pool = Arc::new(KeyPool::new(pool_config, events));
        for keys in &config.service_keys {
            pool.insert_secrets(keys.service, &keys.secrets);
            tracing::info!(
                service = %keys.service,
                count = keys.secrets.len(),
                "registered credentials"
            );
        }

        let queue = AdmissionQueue::new(pool.clone());
        queue.spawn_dispatcher();

        if config.check_keys {
            llmux_pool::spawn_recheckers(pool.clone());
        }

        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            pool,
            queue,
            gcp_tokens: GcpTokenBroker::new(client.clone()),
            client,
            users,
            started_at: SystemTime::now(),
        })
    }
}
