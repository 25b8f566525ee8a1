//! The Event Bus - in-process publish/subscribe hub.
//!
//! Every subscriber owns an independent bounded queue. `publish` fans an
//! event out with a non-blocking `try_send`: a full queue loses the event
//! rather than stalling the producer. Simulation steps and guest execution
//! must never wait on a slow consumer.
//!
//! ```text
//!  Matrix step ─┐                         ┌─► [queue 100] ─► metrics drain
//!  host call   ─┼─► publish ─► RwLock<T> ─┼─► [queue 100] ─► replication
//!  transport   ─┘   (read)                └─► [queue 100] ─► log stream
//! ```

use crate::event::{Event, EventType};
use futures_util::Stream;
use matrix_env::CancelToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Per-subscriber queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Configuration for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events buffered per subscriber before deliveries are dropped
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventType, Vec<SubscriberEntry>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BusInner {
    fn unsubscribe(&self, event_type: EventType, id: u64) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = subscribers.get_mut(&event_type) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                subscribers.remove(&event_type);
            }
        }
    }
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus with the default queue capacity (100).
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                capacity: config.queue_capacity.max(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber for `event_type`.
    ///
    /// Never blocks beyond acquiring the table lock. The returned sequence ends
    /// when `cancel` fires (the entry is then removed), when the bus is closed,
    /// or when the [`Subscription`] is dropped. Subscribing to a closed bus
    /// yields a sequence that is already finished.
    pub fn subscribe(&self, event_type: EventType, cancel: CancelToken) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock so a concurrent close() cannot miss us.
            if !self.inner.closed.load(Ordering::Acquire) {
                subscribers
                    .entry(event_type)
                    .or_default()
                    .push(SubscriberEntry { id, tx });
            }
        }

        let guard = self.spawn_reaper(event_type, id, cancel.clone());
        debug!(%event_type, subscriber = id, "subscribed");

        Subscription {
            rx,
            cancel,
            bus: Arc::downgrade(&self.inner),
            event_type,
            id,
            _reaper_guard: guard,
        }
    }

    /// Removes the entry as soon as `cancel` fires, even if nobody polls.
    ///
    /// Only possible inside a tokio runtime; outside one, removal happens on
    /// the subscriber's next poll or on drop.
    fn spawn_reaper(
        &self,
        event_type: EventType,
        id: u64,
        cancel: CancelToken,
    ) -> Option<oneshot::Sender<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (guard_tx, guard_rx) = oneshot::channel::<()>();
        let bus = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(inner) = bus.upgrade() {
                        inner.unsubscribe(event_type, id);
                    }
                }
                // Subscription dropped; its Drop already unsubscribed.
                _ = guard_rx => {}
            }
        });
        Some(guard_tx)
    }

    /// Fans `event` out to every live subscriber of its type.
    ///
    /// Runs under shared (read) access and uses `try_send`, so it never
    /// blocks on a consumer. A full queue drops the event for that subscriber
    /// only. A no-op after [`close`](Self::close).
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = subscribers.get(&event.event_type()) else {
            return;
        };

        for entry in entries {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = entry.id, event_type = %event.event_type(), "queue full, event dropped");
                }
                // Receiver gone; its Drop is removing the entry.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Terminates every live subscription and clears subscriber state.
    ///
    /// Buffered events are still drained by their subscribers, after which
    /// each sequence ends. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count: usize = subscribers.values().map(Vec::len).sum();
        subscribers.clear();
        debug!(subscribers = count, "event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscribers for `event_type`.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Events accepted by `publish` (before fan-out).
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Successful per-subscriber deliveries.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Per-subscriber deliveries lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy, finite sequence of events for one subscriber.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
    cancel: CancelToken,
    bus: Weak<BusInner>,
    event_type: EventType,
    id: u64,
    _reaper_guard: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Returns `None` once the cancel signal has fired or the bus has closed
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            self.finish();
            return None;
        }
        let cancel = self.cancel.clone();
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = self.rx.recv() => Some(event),
        };
        match received {
            Some(event) => event,
            None => {
                self.finish();
                None
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            self.finish();
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Drains every currently buffered event.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Adapts the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    fn finish(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.unsubscribe(self.event_type, self.id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.unsubscribe(self.event_type, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentEvent, MatrixEvent};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn matrix_event(n: i64) -> Event {
        Event::matrix("m1", n, MatrixEvent::new("tick"))
    }

    #[tokio::test]
    async fn test_publish_routes_by_type() {
        let bus = EventBus::new();
        let mut matrix_sub = bus.subscribe(EventType::Matrix, CancelToken::new());
        let mut agent_sub = bus.subscribe(EventType::Agent, CancelToken::new());

        bus.publish(matrix_event(1));
        bus.publish(Event::agent("a1", 2, AgentEvent::Started));

        assert_eq!(matrix_sub.recv().await.unwrap().timestamp_ms(), 1);
        assert_eq!(agent_sub.recv().await.unwrap().timestamp_ms(), 2);
        assert!(matrix_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Matrix, CancelToken::new());

        for i in 0..150 {
            bus.publish(matrix_event(i));
        }

        let received = sub.drain();
        assert_eq!(received.len(), DEFAULT_QUEUE_CAPACITY);
        // The first 100 made it, in order
        assert_eq!(received[0].timestamp_ms(), 0);
        assert_eq!(received[99].timestamp_ms(), 99);
        assert_eq!(bus.dropped(), 50);
        assert_eq!(bus.delivered(), 100);
        assert_eq!(bus.published(), 150);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_starve_others() {
        let bus = EventBus::with_config(BusConfig { queue_capacity: 2 });
        let mut slow = bus.subscribe(EventType::Matrix, CancelToken::new());
        let mut fast = bus.subscribe(EventType::Matrix, CancelToken::new());

        for i in 0..5 {
            bus.publish(matrix_event(i));
            assert!(fast.try_recv().is_some());
        }
        assert_eq!(slow.drain().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_terminates_and_unsubscribes() {
        let bus = EventBus::new();
        let cancel = CancelToken::new();
        let mut sub = bus.subscribe(EventType::Soul, cancel.clone());
        assert_eq!(bus.subscriber_count(EventType::Soul), 1);

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should end on cancel")
            .unwrap();
        assert!(result.is_none());
        assert_eq!(bus.subscriber_count(EventType::Soul), 0);
    }

    #[tokio::test]
    async fn test_reaper_removes_entry_without_polling() {
        let bus = EventBus::new();
        let cancel = CancelToken::new();
        let _sub = bus.subscribe(EventType::Peer, cancel.clone());

        cancel.cancel();
        for _ in 0..50 {
            if bus.subscriber_count(EventType::Peer) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(bus.subscriber_count(EventType::Peer), 0);
    }

    #[tokio::test]
    async fn test_close_terminates_pending_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Matrix, CancelToken::new());
        let waiter = tokio::spawn(async move { sub.recv().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close must not leave the subscriber hanging")
            .unwrap();
        assert!(result.is_none());
        assert_eq!(bus.subscriber_count(EventType::Matrix), 0);
    }

    #[tokio::test]
    async fn test_close_drains_buffered_then_ends() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Matrix, CancelToken::new());
        bus.publish(matrix_event(1));
        bus.close();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_is_noop() {
        let bus = EventBus::new();
        bus.close();
        bus.publish(matrix_event(1));
        assert_eq!(bus.published(), 0);

        let mut late = bus.subscribe(EventType::Matrix, CancelToken::new());
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventType::Trainer, CancelToken::new());
        assert_eq!(bus.subscriber_count(EventType::Trainer), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(EventType::Trainer), 0);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventType::Matrix, CancelToken::new());
        bus.publish(matrix_event(1));
        bus.publish(matrix_event(2));
        bus.close();

        let seen: Vec<i64> = sub.into_stream().map(|e| e.timestamp_ms()).collect().await;
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_subscribe_outside_runtime() {
        let bus = EventBus::new();
        let cancel = CancelToken::new();
        let mut sub = bus.subscribe(EventType::Matrix, cancel.clone());
        bus.publish(matrix_event(7));
        assert_eq!(sub.try_recv().map(|e| e.timestamp_ms()), Some(7));

        cancel.cancel();
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(EventType::Matrix), 0);
    }
}
