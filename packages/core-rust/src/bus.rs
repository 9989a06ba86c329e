//! Event bus boundary and an in-memory implementation.
//!
//! Components depend only on [`EventPublisher`] and [`EventSubscriber`]; the
//! [`InMemoryEventBus`] is the single-process backbone a node uses by default
//! and the one tests inject.
//!
//! Each subscription owns a bounded queue. A publish that finds a matching
//! queue full waits up to the bus's publish timeout and then fails with
//! [`PublishError::Backpressure`], so slow consumers push back on producers
//! instead of growing memory. A publish is all-or-nothing: on backpressure no
//! matching subscription receives the event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::event::{Event, EventFilter};

/// Default per-subscription queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default time a publisher waits on a full subscription queue.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors returned by [`EventPublisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("event bus is closed")]
    Closed,
    #[error("no subscriber accepts events of type {event_type}")]
    NoSubscribers { event_type: String },
    #[error("subscription {subscription} did not accept the event within {timeout_ms}ms")]
    Backpressure { subscription: u64, timeout_ms: u64 },
}

/// Errors returned by [`EventSubscriber::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("event bus is closed")]
    Closed,
}

/// Publishing side of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers `event` to every matching subscription.
    async fn publish(&self, event: Event) -> Result<(), PublishError>;
}

/// Subscribing side of the bus.
pub trait EventSubscriber: Send + Sync {
    /// Opens a subscription receiving events that match `filter`.
    fn subscribe(&self, filter: EventFilter) -> Result<Subscription, SubscribeError>;
}

struct Slot {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

type SlotTable = Arc<RwLock<Vec<Slot>>>;

/// A stream of events matching one filter.
///
/// A subscription may be shared (behind an `Arc`) by several consumers;
/// every event is handed to exactly one of them. Closing it stops admitting
/// new events while letting consumers drain what is already queued, after
/// which [`Subscription::recv`] returns `None`.
pub struct Subscription {
    id: u64,
    filter: EventFilter,
    receiver: Mutex<mpsc::Receiver<Event>>,
    slots: SlotTable,
    closed: AtomicBool,
}

impl Subscription {
    /// Receives the next event, or `None` once closed and drained.
    ///
    /// Cancel-safe: dropping the future never loses an event.
    pub async fn recv(&self) -> Option<Event> {
        let mut rx = self.receiver.lock().await;
        rx.recv().await
    }

    /// Stops admitting new events. Already queued events remain receivable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.slots.write().retain(|slot| slot.id != self.id);
            debug!(subscription = self.id, "Subscription closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Single-process event bus backed by bounded `mpsc` queues.
pub struct InMemoryEventBus {
    name: String,
    slots: SlotTable,
    next_id: AtomicU64,
    capacity: usize,
    publish_timeout: Duration,
    closed: AtomicBool,
    published: AtomicU64,
    rejected: AtomicU64,
}

impl InMemoryEventBus {
    /// Creates a bus with default capacity and publish timeout.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY, DEFAULT_PUBLISH_TIMEOUT)
    }

    /// Creates a bus with an explicit queue capacity and publish timeout.
    ///
    /// A capacity of 0 is raised to 1.
    #[must_use]
    pub fn with_capacity(name: &str, capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            slots: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            publish_timeout,
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Events accepted by at least one subscription.
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publish attempts that failed.
    #[must_use]
    pub fn events_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Closes the bus: all subscriptions stop admitting events and further
    /// publishes fail with [`PublishError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.slots.write().clear();
            debug!(bus = %self.name, "Event bus closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reject(&self, err: PublishError) -> Result<(), PublishError> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        if self.is_closed() {
            return self.reject(PublishError::Closed);
        }

        // Clone senders out of the lock so a slow queue never blocks subscribe/close.
        let targets: Vec<(u64, mpsc::Sender<Event>)> = self
            .slots
            .read()
            .iter()
            .filter(|slot| slot.filter.matches(&event))
            .map(|slot| (slot.id, slot.tx.clone()))
            .collect();

        // Reserve a slot in every matching queue before sending to any, so a
        // backpressure failure leaves no partial delivery behind.
        let mut permits = Vec::with_capacity(targets.len());
        for (id, tx) in targets {
            match tokio::time::timeout(self.publish_timeout, tx.reserve_owned()).await {
                Ok(Ok(permit)) => permits.push(permit),
                Ok(Err(_)) => {
                    debug!(bus = %self.name, subscription = id, "Skipping dropped subscription");
                }
                Err(_) => {
                    let timeout_ms =
                        u64::try_from(self.publish_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        bus = %self.name,
                        subscription = id,
                        event_type = %event.event_type,
                        timeout_ms,
                        "Subscription queue full, rejecting event"
                    );
                    return self.reject(PublishError::Backpressure {
                        subscription: id,
                        timeout_ms,
                    });
                }
            }
        }

        if permits.is_empty() {
            return self.reject(PublishError::NoSubscribers {
                event_type: event.event_type,
            });
        }
        for permit in permits {
            permit.send(event.clone());
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl EventSubscriber for InMemoryEventBus {
    fn subscribe(&self, filter: EventFilter) -> Result<Subscription, SubscribeError> {
        if self.is_closed() {
            return Err(SubscribeError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.slots.write().push(Slot {
            id,
            filter: filter.clone(),
            tx,
        });

        debug!(bus = %self.name, subscription = id, types = ?filter.types, "Subscription opened");

        Ok(Subscription {
            id,
            filter,
            receiver: Mutex::new(rx),
            slots: Arc::clone(&self.slots),
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::correlation::CorrelationId;
    use crate::event::event_types;
    use crate::payload::ResponsePayload;

    fn event(event_type: &str) -> Event {
        let payload = ResponsePayload::text(CorrelationId::new(), 200, "ok");
        Event::new(event_type, "test", &payload, &JsonCodec).unwrap()
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_rejected() {
        let bus = InMemoryEventBus::new("test");
        let err = bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap_err();
        assert!(matches!(err, PublishError::NoSubscribers { .. }));
        assert_eq!(bus.events_rejected(), 1);
        assert_eq!(bus.events_published(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_only() {
        let bus = InMemoryEventBus::new("test");
        let sub = bus
            .subscribe(EventFilter::types(&[event_types::HTTP_RESPONSE]))
            .unwrap();

        bus.publish(event(event_types::HTTP_RESPONSE)).await.unwrap();
        assert!(bus.publish(event(event_types::HTTP_REQUEST)).await.is_err());

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_type, event_types::HTTP_RESPONSE);
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn every_matching_subscription_gets_a_copy() {
        let bus = InMemoryEventBus::new("test");
        let a = bus.subscribe(EventFilter::all()).unwrap();
        let b = bus.subscribe(EventFilter::all()).unwrap();

        let sent = event(event_types::HTTP_REQUEST);
        bus.publish(sent.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().id, sent.id);
        assert_eq!(b.recv().await.unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let bus = InMemoryEventBus::with_capacity("test", 1, Duration::from_millis(20));
        let _sub = bus.subscribe(EventFilter::all()).unwrap();

        bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap();
        let err = bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap_err();
        assert!(matches!(err, PublishError::Backpressure { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn backpressure_delivers_to_no_subscription() {
        let bus = InMemoryEventBus::with_capacity("test", 1, Duration::from_millis(20));
        let roomy = bus.subscribe(EventFilter::all()).unwrap();
        let full = bus
            .subscribe(EventFilter::types(&[event_types::HTTP_REQUEST]))
            .unwrap();

        bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap();
        roomy.recv().await.unwrap();

        let err = bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap_err();
        assert!(matches!(err, PublishError::Backpressure { subscription, .. } if subscription == full.id()));

        // The rejected event never reached the subscription that had room.
        bus.publish(event(event_types::HTTP_RESPONSE)).await.unwrap();
        let next = roomy.recv().await.unwrap();
        assert_eq!(next.event_type, event_types::HTTP_RESPONSE);
        assert_eq!(bus.events_published(), 2);
        assert_eq!(bus.events_rejected(), 1);
    }

    #[test]
    fn debug_shows_bus_state() {
        let bus = InMemoryEventBus::with_capacity("node-a", 8, Duration::from_millis(5));
        let _sub = bus.subscribe(EventFilter::all()).unwrap();
        let rendered = format!("{bus:?}");
        assert!(rendered.starts_with("InMemoryEventBus"));
        assert!(rendered.contains("\"node-a\""));
        assert!(rendered.contains("capacity: 8"));
        assert!(rendered.contains("subscribers: 1"));
        assert!(rendered.contains("closed: false"));
    }

    #[tokio::test]
    async fn close_drains_queued_events_then_ends() {
        let bus = InMemoryEventBus::new("test");
        let sub = bus.subscribe(EventFilter::all()).unwrap();

        bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap();
        bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap();
        sub.close();

        assert!(sub.is_closed());
        assert!(bus.publish(event(event_types::HTTP_REQUEST)).await.is_err());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shared_subscription_hands_each_event_to_one_consumer() {
        let bus = InMemoryEventBus::new("test");
        let sub = Arc::new(bus.subscribe(EventFilter::all()).unwrap());

        for _ in 0..50 {
            bus.publish(event(event_types::HTTP_REQUEST)).await.unwrap();
        }
        sub.close();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sub = Arc::clone(&sub);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(ev) = sub.recv().await {
                    ids.push(ev.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_subscribe() {
        let bus = InMemoryEventBus::new("test");
        let sub = bus.subscribe(EventFilter::all()).unwrap();
        bus.close();

        assert_eq!(
            bus.publish(event(event_types::HTTP_REQUEST)).await,
            Err(PublishError::Closed)
        );
        assert!(matches!(
            bus.subscribe(EventFilter::all()),
            Err(SubscribeError::Closed)
        ));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropping_subscription_unregisters_it() {
        let bus = InMemoryEventBus::new("test");
        let sub = bus.subscribe(EventFilter::all()).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
