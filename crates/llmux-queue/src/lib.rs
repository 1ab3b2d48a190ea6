//! Partitioned admission queue with key-aware dispatch.
//!
//! One FIFO exists per `(service, model family)` partition so head-of-line
//! blocking on one billing boundary never stalls another. A single
//! dispatcher task drains partitions in round-robin order whenever keys
//! are available.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use llmux_common::{ModelFamily, Service};
use llmux_pool::{KeyPool, KeyRecord, LockoutPeriod};

/// Dispatcher tick; key-state changes and enqueues wake it sooner.
const DISPATCH_TICK: Duration = Duration::from_millis(100);

/// Ring-buffer depth for wait-time smoothing.
const WAIT_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionKey {
    pub service: Service,
    pub family: ModelFamily,
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.family)
    }
}

/// Handed to a waiting request once the dispatcher admits it.
#[derive(Debug)]
pub struct DispatchGrant {
    pub key: KeyRecord,
}

struct Ticket {
    model: String,
    /// First-enqueue time; preserved across re-enqueues so the wait
    /// estimator sees end-to-end waits.
    first_enqueued_at: Instant,
    grant_tx: oneshot::Sender<DispatchGrant>,
}

#[derive(Default)]
struct WaitRing {
    samples: VecDeque<Duration>,
}

impl WaitRing {
    fn record(&mut self, wait: Duration) {
        if self.samples.len() == WAIT_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(wait);
    }

    fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }
}

#[derive(Default)]
struct PartitionState {
    fifo: VecDeque<Ticket>,
    waits: WaitRing,
}

struct QueueInner {
    partitions: BTreeMap<PartitionKey, PartitionState>,
    /// Round-robin start position over the non-empty partition list.
    cursor: usize,
}

pub struct AdmissionQueue {
    pool: Arc<KeyPool>,
    inner: Mutex<QueueInner>,
    wake: Arc<Notify>,
}

impl AdmissionQueue {
    pub fn new(pool: Arc<KeyPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            inner: Mutex::new(QueueInner {
                partitions: BTreeMap::new(),
                cursor: 0,
            }),
            wake: Arc::new(Notify::new()),
        })
    }

    /// Append to the partition tail and wait for a key grant. Dropping the
    /// returned receiver cancels the ticket; the dispatcher skips it on
    /// next look-ahead.
    pub fn enqueue(
        &self,
        partition: PartitionKey,
        model: impl Into<String>,
    ) -> oneshot::Receiver<DispatchGrant> {
        self.enqueue_from(partition, model, Instant::now())
    }

    /// Re-enqueue after a retryable failure: tail placement, original
    /// first-enqueue time kept.
    pub fn enqueue_from(
        &self,
        partition: PartitionKey,
        model: impl Into<String>,
        first_enqueued_at: Instant,
    ) -> oneshot::Receiver<DispatchGrant> {
        let (grant_tx, grant_rx) = oneshot::channel();
        let model = model.into();
        {
            let mut inner = self.lock();
            let state = inner.partitions.entry(partition).or_default();
            state.fifo.push_back(Ticket {
                model,
                first_enqueued_at,
                grant_tx,
            });
            tracing::debug!(partition = %partition, depth = state.fifo.len(), "request queued");
        }
        self.wake.notify_one();
        grant_rx
    }

    pub fn queued_count(&self, partition: PartitionKey) -> usize {
        let inner = self.lock();
        inner
            .partitions
            .get(&partition)
            .map(|state| state.fifo.len())
            .unwrap_or(0)
    }

    /// Smoothed recent end-to-end wait for one partition; informational
    /// only, never used for admission.
    pub fn estimated_wait(&self, partition: PartitionKey) -> Duration {
        let inner = self.lock();
        inner
            .partitions
            .get(&partition)
            .map(|state| state.waits.average())
            .unwrap_or(Duration::ZERO)
    }

    /// Wake the dispatcher; called when an upstream attempt completes.
    pub fn kick(&self) {
        self.wake.notify_one();
    }

    /// One dispatcher pass: visit non-empty partitions round-robin and
    /// drain each while a key is ready and the head ticket is live.
    pub fn dispatch_pass(&self) {
        let now = Instant::now();
        let mut inner = self.lock();

        let keys: Vec<PartitionKey> = inner
            .partitions
            .iter()
            .filter(|(_, state)| !state.fifo.is_empty())
            .map(|(key, _)| *key)
            .collect();
        if keys.is_empty() {
            return;
        }

        let start = inner.cursor % keys.len();
        inner.cursor = inner.cursor.wrapping_add(1);

        for offset in 0..keys.len() {
            let partition = keys[(start + offset) % keys.len()];
            if matches!(
                self.pool.lockout_period(partition.service, partition.family),
                LockoutPeriod::NoKeys
            ) {
                continue;
            }
            let Some(state) = inner.partitions.get_mut(&partition) else {
                continue;
            };

            loop {
                let Some(head) = state.fifo.front() else {
                    break;
                };
                if head.grant_tx.is_closed() {
                    // Client went away while queued; never dispatch it.
                    state.fifo.pop_front();
                    continue;
                }
                match self.pool.get(&head.model, partition.service) {
                    Ok(key) => {
                        if let Some(ticket) = state.fifo.pop_front() {
                            state.waits.record(now - ticket.first_enqueued_at);
                            if ticket.grant_tx.send(DispatchGrant { key }).is_err() {
                                // Lost the race with a disconnect; the
                                // reuse delay on the reserved key is the
                                // only cost.
                                tracing::debug!(
                                    partition = %partition,
                                    "grant dropped by cancelled request"
                                );
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    /// Run the dispatch loop until the queue is dropped. Wakes on enqueue,
    /// key-state changes, attempt completion, and the periodic tick.
    pub fn spawn_dispatcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let wake = self.wake.clone();
        let pool_changed = self.pool.change_notify();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DISPATCH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // Holding only a Weak between passes lets the task die
                // with the queue instead of keeping it alive.
                match weak.upgrade() {
                    Some(queue) => queue.dispatch_pass(),
                    None => return,
                }
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = pool_changed.notified() => {}
                    _ = tick.tick() => {}
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
