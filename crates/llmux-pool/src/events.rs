use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use llmux_common::{ModelFamily, Service};

use crate::record::{DisableReason, KeyHash};

/// Operational key-lifecycle notifications, fanned out to a broadcast
/// channel (for in-process listeners such as the dispatcher and tests) and
/// to registered sinks (logging, external collectors).
#[derive(Debug, Clone)]
pub enum PoolEvent {
    KeyRateLimited {
        hash: KeyHash,
        lockout_ms: u64,
    },
    KeyDisabled {
        hash: KeyHash,
        reason: DisableReason,
    },
    FamilyLost {
        hash: KeyHash,
        family: ModelFamily,
    },
    RecheckCompleted {
        service: Service,
        keys: usize,
    },
}

pub trait PoolEventSink: Send + Sync {
    fn write(&self, event: &PoolEvent);
}

/// Default sink: structured logs.
pub struct TracingEventSink;

impl PoolEventSink for TracingEventSink {
    fn write(&self, event: &PoolEvent) {
        match event {
            PoolEvent::KeyRateLimited { hash, lockout_ms } => {
                tracing::warn!(key = %hash, lockout_ms, "key rate limited");
            }
            PoolEvent::KeyDisabled { hash, reason } => {
                tracing::warn!(key = %hash, ?reason, "key disabled");
            }
            PoolEvent::FamilyLost { hash, family } => {
                tracing::warn!(key = %hash, family = %family, "key lost model family");
            }
            PoolEvent::RecheckCompleted { service, keys } => {
                tracing::info!(service = %service, keys, "credential recheck completed");
            }
        }
    }
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    tx: broadcast::Sender<PoolEvent>,
    sinks: RwLock<Vec<Arc<dyn PoolEventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(HubInner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn PoolEventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub fn emit(&self, event: PoolEvent) {
        let _ = self.inner.tx.send(event.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let sinks = inner.sinks.read().await.clone();
            for sink in sinks {
                sink.write(&event);
            }
        });
    }
}
