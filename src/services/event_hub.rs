//! Fan-out of audit events to live-update subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! queue is full the event is dropped for that subscriber only.

use crate::core::database::LogRecord;
use crate::core::logging::generate_client_id;
use crate::core::metrics::get_metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Insert,
    Update,
}

/// Payload pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    pub entry: LogRecord,
}

impl BroadcastEvent {
    pub fn insert(entry: LogRecord) -> Self {
        Self {
            event_type: EventType::Insert,
            entry,
        }
    }

    pub fn update(entry: LogRecord) -> Self {
        Self {
            event_type: EventType::Update,
            entry,
        }
    }
}

type Sender = mpsc::Sender<Arc<BroadcastEvent>>;

/// Registry of connected subscribers.
pub struct EventHub {
    subscribers: RwLock<HashMap<String, Sender>>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new subscriber with a fresh identity.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = generate_client_id();
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);
        get_metrics().sse_subscribers.inc();
        tracing::info!(client_id = %id, "Live update subscriber connected");

        Subscription {
            id,
            receiver: rx,
            hub: Arc::clone(self),
            shutdown: self.shutdown.child_token(),
        }
    }

    /// Offer `event` to every subscriber without waiting.
    pub fn publish(&self, event: BroadcastEvent) {
        let event = Arc::new(event);
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (id, tx) in subscribers.iter() {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    get_metrics().sse_dropped_events.inc();
                    tracing::warn!(
                        client_id = %id,
                        record_id = event.entry.id,
                        "Subscriber queue full, dropping event"
                    );
                }
                // Receiver is going away; its Drop removes the entry.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// End every subscription and refuse to deliver further events.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *subscribers)
        };
        get_metrics().sse_subscribers.sub(drained.len() as i64);
        if !drained.is_empty() {
            tracing::info!("Closed {} live update subscribers", drained.len());
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn release(&self, id: &str) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            get_metrics().sse_subscribers.dec();
            tracing::info!(client_id = %id, "Live update subscriber disconnected");
        }
    }
}

/// One subscriber's end of the hub. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: String,
    receiver: mpsc::Receiver<Arc<BroadcastEvent>>,
    hub: Arc<EventHub>,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once the hub shuts down.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.release(&self.id);
    }
}
