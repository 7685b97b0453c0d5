//! # Nimbot Bus
//!
//! The message bus that decouples producers from consumers.
//!
//! Two topics: **inbound** (channels, cron and the sub-agent spawner
//! publish; the session router consumes) and **outbound** (the agent loop
//! and the `message` tool publish; the channel manager consumes).
//!
//! ```text
//!  Channel ─┐                          ┌─ SessionRouter → AgentLoop ─┐
//!  Cron    ─┼─ publish_inbound ─▶ Bus ─┤                             │
//!  Spawner ─┘                          └──────── publish_outbound ◀──┘
//!                                                     │
//!                                          ChannelManager → Channel
//! ```
//!
//! Each subscriber has a bounded queue of `capacity` items. A full queue
//! suspends the publisher; nothing is dropped and nothing grows without bound.

mod topic;

pub use topic::Subscription;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use nimbot_core::error::BusError;
use nimbot_core::event::{InboundMessage, OutboundMessage};
use tokio::task::JoinHandle;
use topic::Topic;

/// Default per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// The inbound/outbound bus pair. Cheap to clone; clones share the topics.
#[derive(Clone)]
pub struct MessageBus {
    inbound: Arc<Topic<InboundMessage>>,
    outbound: Arc<Topic<OutboundMessage>>,
}

impl MessageBus {
    /// Create a bus whose subscribers each buffer up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: Arc::new(Topic::new("inbound", capacity)),
            outbound: Arc::new(Topic::new("outbound", capacity)),
        }
    }

    /// Publish a message entering the core.
    ///
    /// Returns how many subscribers received it.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<usize, BusError> {
        tracing::debug!(
            session = %msg.session_key,
            id = %msg.id,
            source = ?msg.source,
            "Publishing inbound message"
        );
        self.inbound.publish(msg).await
    }

    /// Publish a message leaving the core.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<usize, BusError> {
        tracing::debug!(
            session = %msg.session_key,
            in_reply_to = %msg.in_reply_to,
            "Publishing outbound message"
        );
        self.outbound.publish(msg).await
    }

    /// Subscribe to inbound messages matching `predicate`.
    pub fn subscribe_inbound<P>(&self, predicate: P) -> Result<Subscription<InboundMessage>, BusError>
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        self.inbound.subscribe(Arc::new(predicate))
    }

    /// Subscribe to outbound messages matching `predicate`.
    pub fn subscribe_outbound<P>(&self, predicate: P) -> Result<Subscription<OutboundMessage>, BusError>
    where
        P: Fn(&OutboundMessage) -> bool + Send + Sync + 'static,
    {
        self.outbound.subscribe(Arc::new(predicate))
    }

    /// Run `handler` for every inbound message matching `predicate`.
    ///
    /// See [`spawn_handler`] for failure semantics.
    pub fn spawn_inbound_handler<P, F, Fut, E>(
        &self,
        name: impl Into<String>,
        predicate: P,
        handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let sub = self.subscribe_inbound(predicate)?;
        Ok(spawn_handler(name.into(), sub, handler))
    }

    /// Run `handler` for every outbound message matching `predicate`.
    pub fn spawn_outbound_handler<P, F, Fut, E>(
        &self,
        name: impl Into<String>,
        predicate: P,
        handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        P: Fn(&OutboundMessage) -> bool + Send + Sync + 'static,
        F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let sub = self.subscribe_outbound(predicate)?;
        Ok(spawn_handler(name.into(), sub, handler))
    }

    /// Number of live subscribers on each topic, `(inbound, outbound)`.
    pub fn subscriber_counts(&self) -> (usize, usize) {
        (self.inbound.subscriber_count(), self.outbound.subscriber_count())
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    /// Close both topics. Subscriptions end after draining what they hold;
    /// later publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        tracing::info!("Closing message bus");
        self.inbound.close();
        self.outbound.close();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Drive `sub`, handing each item to `handler` one at a time.
///
/// Each invocation runs in its own task: an `Err` or a panic is logged as
/// [`BusError::DeliveryFailed`] and the loop moves on to the next item.
fn spawn_handler<T, F, Fut, E>(name: String, mut sub: Subscription<T>, handler: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = sub.recv().await {
            let outcome = tokio::spawn(handler(item)).await;
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_err) if join_err.is_panic() => "handler panicked".to_string(),
                Err(join_err) => join_err.to_string(),
            };
            let err = BusError::DeliveryFailed {
                subscriber: name.clone(),
                reason,
            };
            tracing::error!(error = %err, "Bus delivery failed");
        }
        tracing::debug!(subscriber = %name, "Bus handler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use nimbot_core::event::SessionKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn inbound(chat: &str, text: &str) -> InboundMessage {
        InboundMessage::user(SessionKey::new("test", chat), "user", text)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MessageBus::new(16);
        let mut sub = bus.subscribe_inbound(|_| true).unwrap();

        for i in 0..5 {
            bus.publish_inbound(inbound("a", &format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap().text, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn every_matching_subscriber_gets_a_copy() {
        let bus = MessageBus::new(16);
        let mut all = bus.subscribe_inbound(|_| true).unwrap();
        let mut only_b = bus.subscribe_inbound(|m| m.session_key.chat_id == "b").unwrap();

        assert_eq!(bus.publish_inbound(inbound("a", "one")).await.unwrap(), 1);
        assert_eq!(bus.publish_inbound(inbound("b", "two")).await.unwrap(), 2);

        assert_eq!(all.recv().await.unwrap().text, "one");
        assert_eq!(all.recv().await.unwrap().text, "two");
        assert_eq!(only_b.recv().await.unwrap().text, "two");
        assert!(only_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_queue_suspends_publisher() {
        let bus = MessageBus::new(1);
        let mut sub = bus.subscribe_inbound(|_| true).unwrap();

        bus.publish_inbound(inbound("a", "first")).await.unwrap();

        let publisher = bus.clone();
        let pending = tokio::spawn(async move { publisher.publish_inbound(inbound("a", "second")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "publish should wait for queue space");

        assert_eq!(sub.recv().await.unwrap().text, "first");
        pending.await.unwrap().unwrap();
        assert_eq!(sub.recv().await.unwrap().text, "second");
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_publish() {
        let bus = MessageBus::new(4);
        let keep = bus.subscribe_outbound(|_| true).unwrap();
        let dropped = bus.subscribe_outbound(|_| true).unwrap();
        assert_eq!(bus.subscriber_counts(), (0, 2));

        drop(dropped);
        let out = OutboundMessage::new(SessionKey::new("test", "a"), "hi", "in-1");
        assert_eq!(bus.publish_outbound(out).await.unwrap(), 1);
        assert_eq!(bus.subscriber_counts(), (0, 1));
        drop(keep);
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_delivery() {
        let bus = MessageBus::new(8);
        let handled = Arc::new(AtomicUsize::new(0));

        let counter = handled.clone();
        let handle = bus
            .spawn_inbound_handler("flaky", |_| true, move |msg: InboundMessage| {
                let counter = counter.clone();
                async move {
                    match msg.text.as_str() {
                        "fail" => Err("refused".to_string()),
                        "panic" => panic!("handler exploded"),
                        _ => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }
            })
            .unwrap();

        for text in ["ok", "fail", "panic", "ok"] {
            bus.publish_inbound(inbound("a", text)).await.unwrap();
        }
        bus.close();
        handle.await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_queued_behind_close_is_rejected() {
        let bus = MessageBus::new(1);
        let mut sub = bus.subscribe_inbound(|_| true).unwrap();
        bus.publish_inbound(inbound("a", "first")).await.unwrap();

        // "second" holds the publish turn, blocked on the full queue;
        // "third" waits behind it.
        let publisher = bus.clone();
        let second = tokio::spawn(async move { publisher.publish_inbound(inbound("a", "second")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let publisher = bus.clone();
        let third = tokio::spawn(async move { publisher.publish_inbound(inbound("a", "third")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.close();
        assert_eq!(sub.recv().await.unwrap().text, "first");
        assert_eq!(second.await.unwrap().unwrap(), 1);
        assert!(matches!(third.await.unwrap(), Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_publishes() {
        let bus = MessageBus::new(4);
        let mut sub = bus.subscribe_inbound(|_| true).unwrap();
        bus.publish_inbound(inbound("a", "queued")).await.unwrap();

        bus.close();
        assert!(matches!(
            bus.publish_inbound(inbound("a", "late")).await,
            Err(BusError::Closed)
        ));
        assert!(bus.subscribe_inbound(|_| true).is_err());

        assert_eq!(sub.next().await.unwrap().text, "queued");
        assert!(sub.next().await.is_none());
    }
}
