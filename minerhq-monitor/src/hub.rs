//! Fan-out of pipeline events to live subscribers.
//!
//! A single task owns the subscriber set. Everyone else talks to it through
//! a [`HubHandle`]: registration, unregistration and a bounded publish queue.
//! Nothing on the publish path ever waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use minerhq_core::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use crate::config::HubConfig;

/// Serialized hub message, `{"type": ..., "data": ...}`.
pub type HubMessage = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub Ulid);

/// A registered subscriber. The mailbox closes when the subscriber is
/// dropped by the hub or the hub shuts down.
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<HubMessage>,
}

#[derive(Debug, thiserror::Error)]
#[error("hub is not running")]
pub struct HubClosed;

#[derive(Debug, Default)]
pub struct HubStats {
    /// Events dropped because the publish queue was full.
    pub dropped: AtomicU64,
    /// Subscribers removed because their mailbox was full or closed.
    pub evicted: AtomicU64,
    pub subscribers: AtomicUsize,
}

#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<(SubscriberId, mpsc::Sender<HubMessage>)>,
    unregister_tx: mpsc::UnboundedSender<SubscriberId>,
    publish_tx: mpsc::Sender<Event>,
    mailbox_capacity: usize,
    stats: Arc<HubStats>,
}

impl HubHandle {
    /// Queues an event for fan-out. Drops it when the queue is full.
    /// Returns whether the event was queued.
    pub fn publish(&self, event: Event) -> bool {
        match self.publish_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(kind = event.kind(), dropped, "Hub queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub stopped, dropping event");
                false
            }
        }
    }

    pub async fn subscribe(&self) -> Result<Subscription, HubClosed> {
        let id = SubscriberId(Ulid::new());
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);

        self.register_tx
            .send((id, tx))
            .await
            .map_err(|_| HubClosed)?;

        Ok(Subscription { id, rx })
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.unregister_tx.send(id);
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.stats.subscribers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &HubStats {
        &self.stats
    }
}

pub struct Hub {
    register_rx: mpsc::Receiver<(SubscriberId, mpsc::Sender<HubMessage>)>,
    unregister_rx: mpsc::UnboundedReceiver<SubscriberId>,
    unregister_tx: mpsc::UnboundedSender<SubscriberId>,
    publish_rx: mpsc::Receiver<Event>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<HubMessage>>,
    stats: Arc<HubStats>,
}

impl Hub {
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(HubStats::default());

        let handle = HubHandle {
            register_tx,
            unregister_tx: unregister_tx.clone(),
            publish_tx,
            mailbox_capacity: config.mailbox_capacity.max(1),
            stats: Arc::clone(&stats),
        };

        let hub = Self {
            register_rx,
            unregister_rx,
            unregister_tx,
            publish_rx,
            subscribers: HashMap::new(),
            stats,
        };

        (hub, handle)
    }

    #[instrument(name = "hub", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(subscribers = self.subscribers.len(), "Hub shutting down");
                    break;
                }
                Some((id, tx)) = self.register_rx.recv() => {
                    self.subscribers.insert(id, tx);
                    self.sync_count();
                    debug!(subscriber = %id.0, "Subscriber registered");
                }
                Some(id) = self.unregister_rx.recv() => {
                    if self.subscribers.remove(&id).is_some() {
                        self.sync_count();
                        debug!(subscriber = %id.0, "Subscriber unregistered");
                    }
                }
                Some(event) = self.publish_rx.recv() => {
                    self.fan_out(&event);
                }
            }
        }

        // Dropping the senders closes every subscriber's mailbox.
        self.subscribers.clear();
        self.sync_count();
    }

    fn fan_out(&self, event: &Event) {
        let message: HubMessage = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, kind = event.kind(), "Failed to encode event");
                return;
            }
        };

        for (id, tx) in &self.subscribers {
            if tx.try_send(Arc::clone(&message)).is_err() {
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = %id.0, "Subscriber not keeping up, disconnecting");
                let _ = self.unregister_tx.send(*id);
            }
        }
    }

    fn sync_count(&self) {
        self.stats
            .subscribers
            .store(self.subscribers.len(), Ordering::Relaxed);
    }
}
