#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-bus** – Entity subscriber registry and notification fan-out.
//!
//! Grounded on the teacher's `toka-bus::MemoryBus`: a process-local,
//! in-memory propagation layer that other components interact with only
//! through a narrow trait. Here the "publish" side is the command consumer
//! (§4.7 step 7, "Notifying") and the payload is the batch of entities a
//! single command appended, delivered in journal order; unlike the
//! teacher's `broadcast`-channel bus, each subscriber call is isolated —
//! a panic or a hang in one subscriber must not affect the others or the
//! command's own result (§7 `SubscriberError`).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;

use aeon_types::{EntityId, HybridTimestamp, LayoutFingerprint};

/// One entity appended by a committed command, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct NotifiedEntity {
    /// Entity identifier.
    pub id: EntityId,
    /// The entity's layout fingerprint.
    pub fingerprint: LayoutFingerprint,
    /// HLC stamp assigned at admission.
    pub timestamp: HybridTimestamp,
}

/// A subscriber to committed entities.
///
/// Implementations should return quickly; a subscriber that blocks past its
/// configured timeout is treated the same as one that panics — its
/// notification is dropped and the next subscriber still runs.
#[async_trait]
pub trait EntitySubscriber: Send + Sync {
    /// Called once per committed command with every entity it appended, in
    /// journal order.
    async fn on_entities(&self, entities: &[NotifiedEntity]);
}

/// Opaque handle returned by [`SubscriberRegistry::add`], used to
/// [`SubscriberRegistry::remove`] the same subscriber later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Registry of entity subscribers plus the isolated fan-out used to notify
/// them (§4.7 step 7).
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<u64, Arc<dyn EntitySubscriber>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl SubscriberRegistry {
    /// Construct a registry with the given per-subscriber notification
    /// timeout (`subscriber_timeout_ms` in configuration, §6).
    pub fn new(timeout: Duration) -> Self {
        Self { subscribers: RwLock::new(HashMap::new()), next_id: AtomicU64::new(0), timeout }
    }

    /// Register a subscriber, returning a handle for later removal.
    pub async fn add(&self, subscriber: Arc<dyn EntitySubscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(id, subscriber);
        SubscriberId(id)
    }

    /// Deregister a subscriber. A no-op if it was already removed.
    pub async fn remove(&self, id: SubscriberId) {
        self.subscribers.write().await.remove(&id.0);
    }

    /// Number of currently registered subscribers.
    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// True if no subscribers are registered.
    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Notify every registered subscriber with `entities`, sequentially and
    /// in registration order, isolating each call: a panic is caught, a
    /// hang past `timeout` is abandoned, and in both cases the failure is
    /// logged and the remaining subscribers still run. Never returns an
    /// error — subscriber failures are `SubscriberError`, which by
    /// definition cannot affect the command's own result.
    pub async fn notify(&self, entities: &[NotifiedEntity]) {
        if entities.is_empty() {
            return;
        }
        let subscribers: Vec<(u64, Arc<dyn EntitySubscriber>)> =
            self.subscribers.read().await.iter().map(|(id, s)| (*id, s.clone())).collect();

        for (id, subscriber) in subscribers {
            let call = AssertUnwindSafe(subscriber.on_entities(entities)).catch_unwind();
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(())) => {}
                Ok(Err(_panic)) => {
                    tracing::warn!(subscriber_id = id, "subscriber panicked during notification");
                }
                Err(_elapsed) => {
                    tracing::warn!(subscriber_id = id, timeout_ms = self.timeout.as_millis() as u64, "subscriber timed out during notification");
                }
            }
        }
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry").field("timeout", &self.timeout).finish()
    }
}
