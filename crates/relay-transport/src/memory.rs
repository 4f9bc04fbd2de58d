//! In-process replication transport.
//!
//! A [`MemoryHub`] plays the role of the pub/sub backend; every
//! [`MemoryTransport`] handed out by it behaves like one node's connection
//! to that backend. Several managers sharing one hub form a cluster inside
//! a single process.

use crate::traits::{Envelope, EnvelopeSink, ReplicationTransport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

struct Subscriber {
    transport: u64,
    online: Arc<AtomicBool>,
    sink: EnvelopeSink,
}

/// Shared in-memory pub/sub backend.
#[derive(Default)]
pub struct MemoryHub {
    topics: DashMap<String, Vec<Subscriber>>,
    next_transport: AtomicU64,
}

impl MemoryHub {
    /// Create a new hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new node to the hub.
    #[must_use]
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            id: self.next_transport.fetch_add(1, Ordering::Relaxed),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Number of live sinks subscribed to a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sink.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, topic: &str, payload: Bytes) -> usize {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            return 0;
        };

        subscribers.retain(|s| !s.sink.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            if !subscriber.online.load(Ordering::Acquire) {
                continue;
            }
            let envelope = Envelope {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if subscriber.sink.send(envelope).is_ok() {
                delivered += 1;
            }
        }

        trace!(topic = %topic, delivered, "Memory hub delivered payload");
        delivered
    }
}

/// One node's link to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    id: u64,
    online: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Simulate losing (or regaining) the link to the backend.
    ///
    /// While unavailable the node can neither publish nor receive.
    pub fn set_available(&self, available: bool) {
        self.online.store(available, Ordering::Release);
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("memory link is down".into()))
        }
    }
}

#[async_trait]
impl ReplicationTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_online()?;
        self.hub.deliver(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sink: EnvelopeSink) -> Result<(), TransportError> {
        self.ensure_online()?;
        self.hub
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                transport: self.id,
                online: Arc::clone(&self.online),
                sink,
            });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Some(mut subscribers) = self.hub.topics.get_mut(topic) {
            subscribers.retain(|s| s.transport != self.id);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.subscribe("t", tx_a).await.unwrap();
        b.subscribe("t", tx_b).await.unwrap();

        a.publish("t", Bytes::from_static(b"hi")).await.unwrap();

        // The publisher receives its own payload too.
        assert_eq!(&rx_a.recv().await.unwrap().payload[..], b"hi");
        let envelope = rx_b.recv().await.unwrap();
        assert_eq!(envelope.topic, "t");
        assert_eq!(&envelope.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.subscribe("app-1", tx).await.unwrap();

        a.publish("app-2", Bytes::from_static(b"x")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unavailable_link() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("t", tx).await.unwrap();

        a.set_available(false);
        assert!(matches!(
            a.publish("t", Bytes::new()).await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(!a.is_healthy());

        b.set_available(false);
        a.set_available(true);
        a.publish("t", Bytes::new()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_closed_sinks() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        a.subscribe("t", tx_a).await.unwrap();
        b.subscribe("t", tx_b).await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 2);

        a.unsubscribe("t").await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 1);

        drop(rx_b);
        assert_eq!(hub.subscriber_count("t"), 0);
        a.publish("t", Bytes::new()).await.unwrap();
    }
}
