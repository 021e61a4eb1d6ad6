//! Alert fan-out.
//!
//! Sessions publish the alerts found in a frame on an [`AlertBus`]; any
//! number of unrelated components subscribe without the publisher knowing
//! who they are. Delivery is fire-and-forget: a subscriber that went away is
//! pruned on the next publish and never affects the session.

use crate::model::Alert;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Alerts from one frame of one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertBatch {
    pub camera_id: String,
    pub alerts: Arc<[Alert]>,
}

/// Identifier handed out by [`AlertBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A registered subscriber.
#[derive(Debug)]
pub struct AlertSubscription {
    pub id: SubscriberId,
    pub receiver: mpsc::UnboundedReceiver<AlertBatch>,
}

impl AlertSubscription {
    pub async fn recv(&mut self) -> Option<AlertBatch> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<AlertBatch, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::UnboundedSender<AlertBatch>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

/// Typed publish/subscribe channel for frame alerts.
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct AlertBus {
    inner: Arc<BusInner>,
}

impl AlertBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> AlertSubscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.write().insert(id, tx);

        debug!(subscriber = id.0, "Alert subscriber registered");
        AlertSubscription { id, receiver: rx }
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.subscribers.write().remove(&id).is_some();
        if removed {
            debug!(subscriber = id.0, "Alert subscriber removed");
        }
        removed
    }

    /// Publish one frame's alerts. Empty lists are not published.
    ///
    /// Returns the number of subscribers the batch was handed to.
    pub fn publish(&self, camera_id: &str, alerts: &[Alert]) -> usize {
        if alerts.is_empty() {
            return 0;
        }

        let batch = AlertBatch {
            camera_id: camera_id.to_string(),
            alerts: Arc::from(alerts),
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, tx) in subscribers.iter() {
                match tx.send(batch.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for id in gone {
                subscribers.remove(&id);
                trace!(subscriber = id.0, "Pruned closed alert subscriber");
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("viewer.alerts.published").increment(alerts.len() as u64);

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Number of non-empty batches published so far.
    pub fn published_batches(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AlertBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_batches())
            .finish()
    }
}
