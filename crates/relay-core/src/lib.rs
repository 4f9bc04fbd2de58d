//! # relay-core
//!
//! Channel state and cluster replication for the Relay realtime server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - the local subscribers of one named room
//! - **Presence** - member identities on top of a channel
//! - **ChannelManager** - every channel of the process, keyed by app
//! - **ReplicationCoordinator** - event fan-out and member count queries
//!   across nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────────┐
//! │  Connection │────▶│ ChannelManager │────▶│ Channel/Presence│
//! └─────────────┘     └────────────────┘     └─────────────────┘
//!                            │
//!                            ▼
//!                  ┌────────────────────────┐     ┌───────────┐
//!                  │ ReplicationCoordinator │◀───▶│ Transport │
//!                  └────────────────────────┘     └───────────┘
//! ```

pub mod channel;
pub mod connection;
pub mod coordinator;
pub mod manager;
pub mod message;
pub mod presence;
pub mod topic;

pub use channel::{Channel, ChannelId, ChannelKind, ChannelNameError};
pub use connection::{ConnectionHandle, ConnectionId, DeliveryError};
pub use coordinator::{CoordinatorConfig, PendingQuery, ReplicationCoordinator};
pub use manager::{
    AppId, ChannelEntry, ChannelInfo, ChannelManager, ManagerConfig, ManagerError, ManagerStats,
    SubscribeOutcome,
};
pub use message::Message;
pub use presence::{Presence, PresenceChannel, PresenceMember};
pub use topic::{topic_for, TopicPurpose};
