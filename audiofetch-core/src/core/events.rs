use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::DeliveryError;
use crate::models::progress::{Progress, Snapshot};

/// Envelope pushed to every subscriber: `{"type": "progress", "data": {...}}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum HubMessage<'a> {
    Progress(&'a Progress),
}

/// Something that can receive serialized snapshots. Delivery must not block.
pub trait ProgressSink: Send + Sync {
    fn deliver(&self, message: &str) -> Result<(), DeliveryError>;
}

impl ProgressSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        self.send(message.to_string())
            .map_err(|e| DeliveryError(e.to_string()))
    }
}

#[derive(Default)]
struct Subscribers {
    sinks: HashMap<u64, Box<dyn ProgressSink>>,
    last_revision: Option<u64>,
}

/// Fan-out of progress snapshots to live observers.
///
/// Subscribe, unsubscribe and publish all take the same lock, which is independent of the
/// task slot lock.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, sink: Box<dyn ProgressSink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers.lock().await.sinks.insert(id, sink);
        tracing::debug!("Subscriber {} attached", id);
        id
    }

    /// Subscribes an in-process channel and returns its receiving end.
    pub async fn subscribe_channel(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Box::new(tx)).await;
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.subscribers.lock().await.sinks.remove(&id).is_some();
        if removed {
            tracing::debug!("Subscriber {} detached", id);
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.sinks.len()
    }

    /// Serializes the snapshot once and hands it to every subscriber, dropping those whose
    /// delivery fails. A snapshot older than one already published is discarded.
    ///
    /// Returns the number of successful deliveries.
    pub async fn publish(&self, snapshot: &Snapshot) -> usize {
        let mut subs = self.subscribers.lock().await;

        if subs.last_revision.is_some_and(|last| snapshot.revision <= last) {
            tracing::trace!("Dropping stale snapshot revision {}", snapshot.revision);
            return 0;
        }
        subs.last_revision = Some(snapshot.revision);

        if subs.sinks.is_empty() {
            return 0;
        }

        let message = match serde_json::to_string(&HubMessage::Progress(&snapshot.progress)) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Failed to serialize progress snapshot: {}", e);
                return 0;
            }
        };

        let mut dead = Vec::new();
        for (id, sink) in subs.sinks.iter() {
            if let Err(e) = sink.deliver(&message) {
                tracing::debug!("Pruning subscriber {}: {}", id, e);
                dead.push(*id);
            }
        }
        for id in &dead {
            subs.sinks.remove(id);
        }

        subs.sinks.len()
    }
}
