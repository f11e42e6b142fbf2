//! Topic-scoped publish/subscribe transports.
//!
//! A [`PubSub`] delivers `(sender, bytes)` for every message published on a
//! subscribed topic by another peer. Delivery is at-least-once and
//! unordered; payload bytes are opaque to the transport.
//!
//! - [`MemoryNetwork`] / [`MemoryPubSub`]: in-process swarm over tokio
//!   broadcast channels
//! - [`WsPubSub`]: WebSocket client of a [`RelayServer`](crate::relay::RelayServer)

pub mod broadcast;
pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PubSubError;
use crate::protocol::PeerId;

pub use broadcast::{TopicGroup, TopicManager, TopicStats};
pub use memory::{MemoryNetwork, MemoryPubSub};
pub use ws::{ConnectionState, WsPubSub};

/// Callback invoked for each delivered message: `(sender, payload)`.
pub type MessageHandler = Arc<dyn Fn(PeerId, Vec<u8>) + Send + Sync>;

/// Peer membership change on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined { topic: String, peer_id: PeerId },
    Left { topic: String, peer_id: PeerId },
}

impl PeerEvent {
    pub fn topic(&self) -> &str {
        match self {
            Self::Joined { topic, .. } | Self::Left { topic, .. } => topic,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Self::Joined { peer_id, .. } | Self::Left { peer_id, .. } => *peer_id,
        }
    }
}

/// Publish/subscribe adapter shared by every replica of a node.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Identity this endpoint publishes under.
    fn peer_id(&self) -> PeerId;

    /// Route messages on `topic` to `handler`, replacing any previous
    /// handler for the topic.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError>;

    /// Broadcast `data` to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError>;

    /// Stream of peer joins and leaves on subscribed topics.
    fn peer_events(&self) -> tokio::sync::broadcast::Receiver<PeerEvent>;
}
