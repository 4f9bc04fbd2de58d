//! Redis pub/sub transport.
//!
//! Publishes go through one multiplexed connection. Every subscribed topic
//! gets its own pub/sub connection and listener task, which resubscribes
//! with [`Backoff`] when Redis drops it.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::traits::{Envelope, EnvelopeSink, ReplicationTransport, TransportError};

fn unavailable(e: redis::RedisError) -> TransportError {
    TransportError::Unavailable(format!("redis: {}", e))
}

/// A node's link to a Redis server, e.g. `redis://10.0.0.5:6379`.
pub struct RedisTransport {
    client: redis::Client,
    publisher: MultiplexedConnection,
    listeners: DashMap<String, Vec<JoinHandle<()>>>,
    healthy: Arc<AtomicBool>,
}

impl RedisTransport {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be
    /// reached.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", url, e)))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", url, e)))?;
        info!("Connected to Redis at {}", url);

        Ok(Self {
            client,
            publisher,
            listeners: DashMap::new(),
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }
}

async fn open_subscription(client: &redis::Client, topic: &str) -> Result<PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(topic).await?;
    Ok(pubsub)
}

async fn listen(
    client: redis::Client,
    topic: String,
    mut pubsub: PubSub,
    sink: EnvelopeSink,
    healthy: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::default();
    loop {
        {
            let messages = pubsub.on_message();
            tokio::pin!(messages);
            while let Some(msg) = messages.next().await {
                let envelope = Envelope {
                    topic: msg.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if sink.send(envelope).is_err() {
                    return;
                }
            }
        }

        healthy.store(false, Ordering::Release);
        warn!(topic = %topic, "Redis subscription dropped, resubscribing");
        pubsub = loop {
            if sink.is_closed() {
                return;
            }
            tokio::time::sleep(backoff.next_delay()).await;
            match open_subscription(&client, &topic).await {
                Ok(pubsub) => break pubsub,
                Err(e) => debug!(topic = %topic, error = %e, "Redis resubscribe failed"),
            }
        };
        backoff.reset();
        healthy.store(true, Ordering::Release);
        info!(topic = %topic, "Redis subscription restored");
    }
}

#[async_trait]
impl ReplicationTransport for RedisTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut conn = self.publisher.clone();
        match conn.publish::<_, _, ()>(topic, payload.to_vec()).await {
            Ok(()) => {
                self.healthy.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(unavailable(e))
            }
        }
    }

    async fn subscribe(&self, topic: &str, sink: EnvelopeSink) -> Result<(), TransportError> {
        let pubsub = open_subscription(&self.client, topic)
            .await
            .map_err(unavailable)?;
        let listener = tokio::spawn(listen(
            self.client.clone(),
            topic.to_string(),
            pubsub,
            sink,
            Arc::clone(&self.healthy),
        ));
        self.listeners
            .entry(topic.to_string())
            .or_default()
            .push(listener);
        debug!(topic = %topic, "Subscribed on Redis");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Some((_, listeners)) = self.listeners.remove(topic) {
            for listener in listeners {
                listener.abort();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            for listener in entry.value() {
                listener.abort();
            }
        }
    }
}
