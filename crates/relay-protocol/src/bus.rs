//! Frames spoken between a node and the WebSocket hub.
//!
//! The hub is a dumb topic router: it never looks inside `payload`.

use serde::{Deserialize, Serialize};

/// A hub link frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// Start receiving publishes on `topic`.
    Subscribe { topic: String },

    /// Stop receiving publishes on `topic`.
    Unsubscribe { topic: String },

    /// A payload published on `topic`. Sent by nodes to the hub and by the
    /// hub to every node subscribed to the topic.
    Publish {
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl BusFrame {
    /// The topic this frame refers to.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            BusFrame::Subscribe { topic }
            | BusFrame::Unsubscribe { topic }
            | BusFrame::Publish { topic, .. } => topic,
        }
    }
}
