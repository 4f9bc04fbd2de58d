//! # relay-transport
//!
//! Replication transports for the Relay realtime server.
//!
//! Nodes of one deployment share no memory; everything they need to know
//! about each other travels over a publish/subscribe link:
//!
//! - **Memory** - an in-process hub, for tests and single-process setups
//! - **WebSocket** - one process runs a [`HubServer`] and every node
//!   connects to it with a [`WebSocketTransport`]
//! - **Redis** - nodes share a Redis server's pub/sub channels through a
//!   `RedisTransport` (`redis` feature)
//!
//! ## Transport Abstraction
//!
//! All transports implement [`ReplicationTransport`], so the coordinator in
//! `tenvis-relay-core` never knows which backend it talks to.
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{MemoryHub, ReplicationTransport};
//!
//! let hub = MemoryHub::new();
//! let transport = hub.transport();
//! let (sink, mut inbox) = tokio::sync::mpsc::unbounded_channel();
//! transport.subscribe("relay:events:A", sink).await?;
//! transport.publish("relay:events:A", payload).await?;
//! ```

pub mod memory;
pub mod traits;

#[cfg(any(feature = "websocket", feature = "redis"))]
pub mod backoff;
#[cfg(feature = "redis")]
pub mod redis_pubsub;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryHub, MemoryTransport};
pub use traits::{Envelope, EnvelopeSink, PeerView, ReplicationTransport, StaticPeers, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{HubHandle, HubServer, WebSocketTransport};

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisTransport;
