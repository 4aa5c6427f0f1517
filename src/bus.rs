//! In-process publish/subscribe hub between the change producers and the
//! replication server.
//!
//! Every [`Subscription`] owns its own bounded queue, so a slow or dead
//! subscriber never delays delivery to the others. A subscriber whose queue
//! is full when an event is published is evicted: it keeps what it already
//! received, then its [`Subscription::recv`] returns `None`.

use crate::error::{MirrorError, Result};
use crate::event::{ChangeEvent, ChangeKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Queue depth used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Identifies one subscription for its whole lifetime.
pub type SubscriptionId = u64;

struct Entry {
    id: SubscriptionId,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    handlers: HashMap<ChangeKind, Vec<Entry>>,
}

impl Registry {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for entries in self.handlers.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= entries.len() != before;
        }
        removed
    }
}

struct BusInner {
    registry: Mutex<Registry>,
    capacity: usize,
    next_id: AtomicU64,
}

impl BusInner {
    // Never held across an await point or while subscriber code runs.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the event bus. Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus whose subscriptions each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a subscriber for the given kinds.
    ///
    /// One subscription spanning several kinds receives them in publish
    /// order through a single queue.
    pub fn subscribe(&self, kinds: &[ChangeKind]) -> Result<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let mut registry = self.inner.lock();
        if registry.closed {
            return Err(MirrorError::BusClosed);
        }
        for kind in kinds {
            let entries = registry.handlers.entry(*kind).or_default();
            if entries.iter().all(|entry| entry.id != id) {
                entries.push(Entry { id, tx: tx.clone() });
            }
        }
        drop(registry);

        debug!("Subscription {} registered for {:?}", id, kinds);
        Ok(Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Hands `event` to every subscriber of its kind without waiting on any of them.
    ///
    /// Returns how many subscribers accepted the event. Events published with
    /// no subscribers are dropped.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut registry = self.inner.lock();
        let Some(entries) = registry.handlers.get(&event.kind()) else {
            debug!("No subscribers for {} {}", event.kind(), event.path());
            return 0;
        };

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for entry in entries {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Subscription {} is lagging ({} queued events), disconnecting it",
                        entry.id, self.inner.capacity
                    );
                    evicted.push(entry.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscription {} closed, pruning", entry.id);
                    evicted.push(entry.id);
                }
            }
        }
        for id in evicted {
            registry.remove(id);
        }

        debug!(
            "Published {} {} to {} subscriber(s)",
            event.kind(),
            event.path(),
            delivered
        );
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let registry = self.inner.lock();
        let mut ids: Vec<SubscriptionId> = registry
            .handlers
            .values()
            .flat_map(|entries| entries.iter().map(|entry| entry.id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Removes a subscription. Safe to call more than once.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().remove(id)
    }

    /// Drops every subscription and refuses new ones.
    pub fn shutdown(&self) {
        let mut registry = self.inner.lock();
        registry.closed = true;
        registry.handlers.clear();
        info!("Event bus shut down.");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// One subscriber's end of the bus. Dropping it deregisters.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<ChangeEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. `None` once the subscription has been
    /// evicted, removed, or the bus shut down, and the queue is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Deregisters now instead of on drop.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if inner.lock().remove(self.id) {
                debug!("Subscription {} deregistered", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> ChangeEvent {
        ChangeEvent::create_file(path, "x").unwrap()
    }

    #[tokio::test]
    async fn fans_out_in_publish_order() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe(&ChangeKind::ALL).unwrap();
        let mut b = bus.subscribe(&ChangeKind::ALL).unwrap();

        assert_eq!(bus.publish(file("/1.txt")), 2);
        assert_eq!(bus.publish(ChangeEvent::update("/1.txt", "y").unwrap()), 2);
        assert_eq!(bus.publish(ChangeEvent::delete("/1.txt", false).unwrap()), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.unwrap().kind(), ChangeKind::Create);
            assert_eq!(sub.recv().await.unwrap().kind(), ChangeKind::Update);
            assert_eq!(sub.recv().await.unwrap().kind(), ChangeKind::Delete);
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(file("/early.txt")), 0);

        let mut late = bus.subscribe(&ChangeKind::ALL).unwrap();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn filters_by_kind() {
        let bus = EventBus::new(4);
        let mut deletes = bus.subscribe(&[ChangeKind::Delete]).unwrap();
        assert_eq!(bus.publish(file("/a.txt")), 0);
        assert_eq!(bus.publish(ChangeEvent::delete("/a.txt", false).unwrap()), 1);
        assert_eq!(deletes.try_recv().unwrap().kind(), ChangeKind::Delete);
    }

    #[test]
    fn drop_deregisters() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(&ChangeKind::ALL).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(file("/a.txt")), 0);
    }

    #[test]
    fn subscription_unsubscribes_itself() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(&ChangeKind::ALL).unwrap();
        let _other = bus.subscribe(&ChangeKind::ALL).unwrap();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(file("/a.txt")), 1);
    }

    #[test]
    fn unsubscribe_while_handling_an_event() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&ChangeKind::ALL).unwrap();
        bus.publish(file("/a.txt"));

        let event = sub.try_recv().unwrap();
        assert_eq!(event.path(), "/a.txt");
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn lagging_subscriber_is_evicted_without_affecting_others() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe(&ChangeKind::ALL).unwrap();
        let mut fast = bus.subscribe(&ChangeKind::ALL).unwrap();

        for i in 0..2 {
            assert_eq!(bus.publish(file(&format!("/{}.txt", i))), 2);
            assert!(fast.try_recv().is_some());
        }
        // slow never drained; its queue is full now
        assert_eq!(bus.publish(file("/2.txt")), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(fast.try_recv().unwrap().path(), "/2.txt");

        assert_eq!(slow.try_recv().unwrap().path(), "/0.txt");
        assert_eq!(slow.try_recv().unwrap().path(), "/1.txt");
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&ChangeKind::ALL).unwrap();
        bus.shutdown();

        assert!(bus.is_closed());
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.subscribe(&ChangeKind::ALL),
            Err(MirrorError::BusClosed)
        ));
        assert_eq!(bus.publish(file("/a.txt")), 0);
    }
}
