//! Subscription registry and non-blocking fan-out.
//!
//! Two kinds of subscriber exist: head subscribers receive every block
//! transition, address subscribers receive events emitted by one address.
//! Each owns a bounded event queue and a bounded error queue. Dispatch never
//! waits on a subscriber: a full queue drops the notice and, if possible,
//! leaves a [`SubscriptionError::QueueFull`] on the error queue instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{SubscriptionError, TrackError};
use crate::queue::{bounded, PushError, QueueReceiver, QueueSender};
use crate::types::{BlockRecord, EventRecord};

/// Producer side of one subscription, held by the registry.
#[derive(Debug)]
struct Outbox<T> {
    id: u64,
    topic: Option<String>,
    events: QueueSender<T>,
    errors: QueueSender<SubscriptionError>,
}

impl<T> Outbox<T> {
    fn close(&self) {
        let closed_events = self.events.close();
        let closed_errors = self.errors.close();
        if closed_events || closed_errors {
            debug!(subscription = self.id, "subscription closed");
        }
    }

    fn offer(&self, item: T, describe: impl FnOnce(&T) -> String) {
        match self.events.try_push(item) {
            Ok(()) => {}
            Err(PushError::Closed(_)) => {}
            Err(PushError::Full(item)) => {
                let dropped = describe(&item);
                warn!(
                    subscription = self.id,
                    dropped = %dropped,
                    "subscriber queue full, dropping notice"
                );
                self.signal(SubscriptionError::QueueFull {
                    subscription: self.id,
                    dropped,
                });
            }
        }
    }

    fn signal(&self, err: SubscriptionError) {
        if let Err(PushError::Full(err)) = self.errors.try_push(err) {
            warn!(subscription = self.id, error = %err, "error queue full, dropping error");
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    heads: HashMap<u64, Arc<Outbox<BlockRecord>>>,
    events: HashMap<u64, Arc<Outbox<EventRecord>>>,
}

/// The set of live subscriptions, guarded by one reader/writer lock.
///
/// Dispatch paths hold the read lock only long enough to copy the outboxes
/// they need; registry mutation takes the write lock.
#[derive(Debug)]
pub struct Dispatcher {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    error_capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize, error_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            capacity,
            error_capacity,
        }
    }

    /// Register a subscriber for every block transition.
    pub fn subscribe_heads(self: &Arc<Self>) -> Subscription<BlockRecord> {
        let (outbox, sub) = self.open(None);
        self.registry.write().heads.insert(outbox.id, outbox);
        sub
    }

    /// Register a subscriber for events emitted by `address`.
    pub fn subscribe_events(self: &Arc<Self>, address: impl Into<String>) -> Subscription<EventRecord> {
        let (outbox, sub) = self.open(Some(address.into()));
        self.registry.write().events.insert(outbox.id, outbox);
        sub
    }

    fn open<T>(self: &Arc<Self>, topic: Option<String>) -> (Arc<Outbox<T>>, Subscription<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = bounded(self.capacity);
        let (errors_tx, errors_rx) = bounded(self.error_capacity);
        debug!(subscription = id, topic = ?topic, "subscription opened");
        let outbox = Arc::new(Outbox {
            id,
            topic: topic.clone(),
            events: events_tx,
            errors: errors_tx,
        });
        let sub = Subscription {
            id,
            topic,
            events: events_rx,
            errors: errors_rx,
            dispatcher: Arc::clone(self),
        };
        (outbox, sub)
    }

    /// Remove a subscription and close both of its queues.
    ///
    /// Returns `false` if it was already gone (unsubscribed or stopped).
    pub fn unsubscribe(&self, id: u64) -> bool {
        let (head, event) = {
            let mut reg = self.registry.write();
            (reg.heads.remove(&id), reg.events.remove(&id))
        };
        match (head, event) {
            (Some(outbox), _) => {
                outbox.close();
                true
            }
            (_, Some(outbox)) => {
                outbox.close();
                true
            }
            (None, None) => false,
        }
    }

    /// Whether subscription `id` is still registered.
    pub fn contains(&self, id: u64) -> bool {
        let reg = self.registry.read();
        reg.heads.contains_key(&id) || reg.events.contains_key(&id)
    }

    /// Remove and close every subscription. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let (heads, events) = {
            let mut reg = self.registry.write();
            (
                std::mem::take(&mut reg.heads),
                std::mem::take(&mut reg.events),
            )
        };
        let n = heads.len() + events.len();
        heads.values().for_each(|o| o.close());
        events.values().for_each(|o| o.close());
        n
    }

    /// Distinct addresses with at least one live subscriber.
    pub fn addresses(&self) -> Vec<String> {
        let reg = self.registry.read();
        let mut out: Vec<String> = Vec::with_capacity(reg.events.len());
        for topic in reg.events.values().filter_map(|o| o.topic.as_ref()) {
            if !out.iter().any(|t| t.eq_ignore_ascii_case(topic)) {
                out.push(topic.clone());
            }
        }
        out
    }

    /// Deliver a block record to every head subscriber.
    pub fn dispatch_head(&self, head: &BlockRecord) {
        let outboxes: Vec<_> = self.registry.read().heads.values().cloned().collect();
        for outbox in outboxes {
            outbox.offer(head.clone(), |h| format!("head {} ({})", h.number, h.state));
        }
    }

    /// Deliver each event to the subscribers of its emitting address.
    pub fn dispatch_events(&self, events: &[EventRecord]) {
        if events.is_empty() {
            return;
        }
        let outboxes: Vec<_> = self.registry.read().events.values().cloned().collect();
        for event in events {
            for outbox in outboxes.iter().filter(|o| {
                o.topic
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case(&event.address))
            }) {
                outbox.offer(event.clone(), |e| {
                    format!("event {}#{} ({})", e.block_number, e.log_index, e.state)
                });
            }
        }
    }

    /// Best-effort error notice to every address subscriber.
    ///
    /// Head subscribers are not notified here; they see their queues close
    /// when the tracker stops.
    pub fn broadcast_error(&self, err: Arc<TrackError>) {
        let outboxes: Vec<_> = self.registry.read().events.values().cloned().collect();
        for outbox in outboxes {
            outbox.signal(SubscriptionError::Unrecoverable(Arc::clone(&err)));
        }
    }

    pub fn head_subscribers(&self) -> usize {
        self.registry.read().heads.len()
    }

    pub fn event_subscribers(&self) -> usize {
        self.registry.read().events.len()
    }
}

/// Consumer handle for one subscription.
///
/// Dropping the handle unsubscribes it.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    topic: Option<String>,
    events: QueueReceiver<T>,
    errors: QueueReceiver<SubscriptionError>,
    dispatcher: Arc<Dispatcher>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The watched address (`None` for head subscriptions).
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Wait for the next notice. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.events.try_recv()
    }

    /// Wait for the next error notice. `None` once unsubscribed and drained.
    pub async fn recv_error(&mut self) -> Option<SubscriptionError> {
        self.errors.recv().await
    }

    pub fn try_recv_error(&mut self) -> Option<SubscriptionError> {
        self.errors.try_recv()
    }

    /// Number of notices waiting to be read.
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// `true` once unsubscribed or closed by the tracker stopping.
    pub fn is_closed(&self) -> bool {
        !self.dispatcher.contains(self.id)
    }

    /// Stop receiving. Idempotent, and safe to race with the tracker stopping.
    pub fn unsubscribe(&self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}
