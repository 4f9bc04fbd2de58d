//! # relay-protocol
//!
//! Wire protocol definitions for the Relay realtime server.
//!
//! Three families of messages travel over the wire:
//!
//! - [`Frame`] - exchanged between a client connection and the server
//! - [`ReplicationMessage`] - exchanged between server nodes over the
//!   replication transport (event fan-out and member-count queries)
//! - [`BusFrame`] - the envelope a node and the WebSocket hub use to carry
//!   topic subscriptions and publishes
//!
//! All of them are MessagePack-encoded through [`codec`].
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Frame};
//!
//! let frame = Frame::publish("presence-lobby", b"hello".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: Frame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod bus;
pub mod codec;
pub mod frames;
pub mod replication;

pub use bus::BusFrame;
pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, PresenceData, PROTOCOL_VERSION};
pub use replication::{NodeId, QueryId, ReplicationMessage};
