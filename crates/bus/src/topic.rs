//! A single bounded pub/sub topic.
//!
//! Every subscriber owns a bounded queue. Publishing is serialized per topic
//! and waits for room in each matching subscriber's queue, so a slow
//! consumer throttles producers instead of losing messages.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use nimbot_core::error::BusError;
use tokio::sync::mpsc;

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    predicate: Predicate<T>,
    tx: mpsc::Sender<T>,
}

pub(crate) struct Topic<T> {
    name: &'static str,
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    publish_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            publish_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber<T>>> {
        // A poisoned list is still a valid list.
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn subscribe(&self, predicate: Predicate<T>) -> Result<Subscription<T>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers().push(Subscriber { id, predicate, tx });
        tracing::debug!(topic = self.name, subscriber = id, "Subscribed");
        Ok(Subscription { id, rx })
    }

    /// Deliver `item` to every matching subscriber, in subscription order.
    ///
    /// Suspends while a matching subscriber's queue is full.
    pub(crate) async fn publish(&self, item: T) -> Result<usize, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let _serialized = self.publish_lock.lock().await;
        // `close` may have run while this publish waited for its turn.
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let targets: Vec<(u64, mpsc::Sender<T>)> = self
            .lock_subscribers()
            .iter()
            .filter(|s| !s.tx.is_closed() && (s.predicate)(&item))
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(item.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(topic = self.name, subscriber = id, "Subscriber went away mid-publish");
            }
        }

        self.prune();
        Ok(delivered)
    }

    fn prune(&self) {
        let mut subs = self.lock_subscribers();
        let before = subs.len();
        subs.retain(|s| !s.tx.is_closed());
        let pruned = before - subs.len();
        if pruned > 0 {
            tracing::debug!(topic = self.name, pruned, "Pruned dropped subscriptions");
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End every subscription. Queued items are still readable.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock_subscribers().clear();
    }
}

/// A live subscription to one topic.
///
/// Yields items in publish order. Ends once the bus is closed and the
/// queue has been drained. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next item; `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already-queued item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
