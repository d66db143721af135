//! Broadcast fan-out to connected browsers.
//!
//! Every subscriber owns a bounded frame queue drained by its connection's
//! writer task. Broadcasting only enqueues, so a slow browser never blocks
//! the others; a subscriber whose queue is full or closed is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use browser_kube_core::{BroadcastEvent, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Serialized text frame shared by all subscribers of one broadcast.
pub type Frame = Arc<str>;

/// Identifier of a registered subscriber.
pub type SubscriberId = Uuid;

struct Subscriber {
    tx: mpsc::Sender<Frame>,
    peer: String,
    connected_at: DateTime<Utc>,
}

/// Receiving side handed to the connection that registered.
pub struct SubscriberHandle {
    pub id: SubscriberId,
    pub frames: mpsc::Receiver<Frame>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Set of live subscribers.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    queue_capacity: usize,
}

impl BroadcastHub {
    /// Create a hub whose subscribers buffer up to `queue_capacity` frames.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new subscriber with `snapshot` as its first frame.
    pub fn register(&self, peer: impl Into<String>, snapshot: &BroadcastEvent) -> Result<SubscriberHandle> {
        let frame: Frame = snapshot.to_frame()?.into();
        let (tx, frames) = mpsc::channel(self.queue_capacity);
        // Fresh queue with capacity >= 1 always accepts the first frame.
        let _ = tx.try_send(frame);

        let id = Uuid::new_v4();
        let peer = peer.into();
        tracing::info!(subscriber = %id, peer = %peer, "Subscriber registered");
        self.subscribers.lock().insert(
            id,
            Subscriber {
                tx,
                peer,
                connected_at: Utc::now(),
            },
        );

        Ok(SubscriberHandle { id, frames })
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(id);
        match removed {
            Some(subscriber) => {
                let connected_secs = (Utc::now() - subscriber.connected_at).num_seconds();
                tracing::info!(
                    subscriber = %id,
                    peer = %subscriber.peer,
                    connected_secs,
                    "Subscriber unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every subscriber.
    ///
    /// Subscribers that cannot accept the frame are unregistered; delivery to
    /// the rest is unaffected.
    pub fn broadcast(&self, event: &BroadcastEvent) -> Result<Delivery> {
        let frame: Frame = event.to_frame()?.into();
        let mut delivery = Delivery::default();

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, subscriber| match subscriber.tx.try_send(frame.clone()) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "connection closed",
                };
                tracing::warn!(
                    subscriber = %id,
                    peer = %subscriber.peer,
                    event = event.kind(),
                    reason,
                    "Dropping subscriber after failed delivery"
                );
                delivery.failed += 1;
                false
            }
        });

        tracing::debug!(
            event = event.kind(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "Broadcast"
        );
        Ok(delivery)
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}
