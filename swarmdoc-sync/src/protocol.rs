//! Wire formats for document synchronization.
//!
//! Two layers, both bincode-encoded (standard config):
//!
//! ```text
//! Frame (transport envelope)
//! ┌────────────┬───────────┬──────────────┬──────────────────────┐
//! │ frame_type │ peer_id   │ topic        │ payload              │
//! │ 1 byte     │ 16 bytes  │ len + utf-8  │ len + bytes          │
//! └────────────┴───────────┴──────────────┴──────────────────────┘
//!
//! SyncMessage (payload of a Publish frame)
//! ┌─────────────────────────────────────────────────────────────┐
//! │ changes: map<ChangeId, Option<ChangeSet>>                   │
//! │   Some(bytes) = inline change, None = "I have this one"     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ChangeId` is the hex SHA-256 of a change set's bytes, so every peer
//! derives the same id for the same change without coordination.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identity of a peer on the pubsub layer.
pub type PeerId = Uuid;

/// Names a document; doubles as its pubsub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic used for this document's sync traffic.
    pub fn topic(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Content address of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    /// Compute the content address of `bytes` (lowercase hex SHA-256).
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines: the first 12 characters.
    ///
    /// Ids arrive off the wire as arbitrary strings, so the cut is made on a
    /// char boundary.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChangeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Serialized diff produced by a CRDT adapter. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(Vec<u8>);

impl ChangeSet {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ChangeSet {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A batch of change announcements broadcast on a document topic.
///
/// Entries carrying a payload are inline changes. Entries without one
/// advertise an id the sender holds without re-sending its bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub changes: BTreeMap<ChangeId, Option<ChangeSet>>,
}

impl SyncMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the announcement for a local edit: every id in `known` is
    /// advertised without payload, `id` carries `change` inline.
    pub fn announce<'a>(
        known: impl IntoIterator<Item = &'a ChangeId>,
        id: ChangeId,
        change: ChangeSet,
    ) -> Self {
        let mut changes: BTreeMap<ChangeId, Option<ChangeSet>> =
            known.into_iter().map(|k| (k.clone(), None)).collect();
        changes.insert(id, Some(change));
        Self { changes }
    }

    pub fn insert_inline(&mut self, id: ChangeId, change: ChangeSet) {
        self.changes.insert(id, Some(change));
    }

    pub fn insert_absent(&mut self, id: ChangeId) {
        self.changes.insert(id, None);
    }

    /// Entries that carry their change set.
    pub fn inline(&self) -> impl Iterator<Item = (&ChangeId, &ChangeSet)> {
        self.changes
            .iter()
            .filter_map(|(id, change)| change.as_ref().map(|c| (id, c)))
    }

    /// Ids advertised without payload.
    pub fn absent(&self) -> impl Iterator<Item = &ChangeId> {
        self.changes
            .iter()
            .filter(|(_, change)| change.is_none())
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Frame types for the pubsub transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Join a topic
    Subscribe = 1,
    /// Leave a topic
    Unsubscribe = 2,
    /// Message for every other subscriber of a topic
    Publish = 3,
    /// A peer subscribed to the topic
    PeerJoined = 4,
    /// A peer left the topic
    PeerLeft = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Transport envelope: `{from, data}` scoped to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_type: FrameType,
    pub peer_id: PeerId,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn subscribe(peer_id: PeerId, topic: impl Into<String>) -> Self {
        Self::control(FrameType::Subscribe, peer_id, topic)
    }

    pub fn unsubscribe(peer_id: PeerId, topic: impl Into<String>) -> Self {
        Self::control(FrameType::Unsubscribe, peer_id, topic)
    }

    pub fn publish(peer_id: PeerId, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Publish,
            peer_id,
            topic: topic.into(),
            payload,
        }
    }

    pub fn peer_joined(peer_id: PeerId, topic: impl Into<String>) -> Self {
        Self::control(FrameType::PeerJoined, peer_id, topic)
    }

    pub fn peer_left(peer_id: PeerId, topic: impl Into<String>) -> Self {
        Self::control(FrameType::PeerLeft, peer_id, topic)
    }

    pub fn ping(peer_id: PeerId) -> Self {
        Self::control(FrameType::Ping, peer_id, String::new())
    }

    pub fn pong(peer_id: PeerId) -> Self {
        Self::control(FrameType::Pong, peer_id, String::new())
    }

    fn control(frame_type: FrameType, peer_id: PeerId, topic: impl Into<String>) -> Self {
        Self {
            frame_type,
            peer_id,
            topic: topic.into(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidFrame(FrameType),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrame(t) => write!(f, "Unexpected frame type {t:?}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_id_is_content_address() {
        let a = ChangeId::of(b"set x = 1");
        let b = ChangeId::of(b"set x = 1");
        let c = ChangeId::of(b"set x = 2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_change_id_known_digest() {
        // SHA-256 of the empty string
        assert_eq!(
            ChangeId::of(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(ChangeId::of(b"").short(), "e3b0c44298fc");
    }

    #[test]
    fn test_short_id_cuts_on_char_boundary() {
        assert_eq!(ChangeId::of(b"").short(), "e3b0c44298fc");
        assert_eq!(ChangeId::from("h1").short(), "h1");

        // 'é' spans bytes 11..13
        let id = ChangeId::from("aéééééééééééé");
        assert_eq!(id.short(), "aééééééééééé");
        assert_eq!(id.short().chars().count(), 12);
    }

    #[test]
    fn test_announce_marks_known_absent() {
        let h1 = ChangeId::from("h1");
        let h2 = ChangeId::from("h2");
        let msg = SyncMessage::announce([&h1], h2.clone(), ChangeSet::new(vec![2]));

        assert_eq!(msg.len(), 2);
        assert_eq!(msg.absent().collect::<Vec<_>>(), vec![&h1]);
        let inline: Vec<_> = msg.inline().collect();
        assert_eq!(inline.len(), 1);
        assert_eq!(inline[0].0, &h2);
        assert_eq!(inline[0].1.as_bytes(), &[2]);
    }

    #[test]
    fn test_announce_new_id_wins_over_known() {
        // A freshly computed id that was already known still goes inline
        let h1 = ChangeId::from("h1");
        let msg = SyncMessage::announce([&h1], h1.clone(), ChangeSet::new(vec![1]));
        assert_eq!(msg.len(), 1);
        assert_eq!(msg.absent().count(), 0);
    }

    #[test]
    fn test_sync_message_preserves_absence_marker() {
        let mut msg = SyncMessage::new();
        msg.insert_absent(ChangeId::from("h1"));
        msg.insert_inline(ChangeId::from("h2"), ChangeSet::new(Vec::new()));

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        // An empty inline payload must not collapse into "absent"
        assert_eq!(decoded, msg);
        assert_eq!(decoded.changes[&ChangeId::from("h1")], None);
        assert_eq!(
            decoded.changes[&ChangeId::from("h2")],
            Some(ChangeSet::new(Vec::new()))
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(Frame::decode(&garbage).is_err());
    }

    #[test]
    fn test_publish_frame_carries_sender() {
        let peer = Uuid::new_v4();
        let frame = Frame::publish(peer, "notes", vec![1, 2, 3]);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Publish);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.topic, "notes");
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_frame_type_values() {
        assert_eq!(FrameType::Subscribe as u8, 1);
        assert_eq!(FrameType::Unsubscribe as u8, 2);
        assert_eq!(FrameType::Publish as u8, 3);
        assert_eq!(FrameType::PeerJoined as u8, 4);
        assert_eq!(FrameType::PeerLeft as u8, 5);
        assert_eq!(FrameType::Ping as u8, 6);
        assert_eq!(FrameType::Pong as u8, 7);
    }

    #[test]
    fn test_document_id_is_topic() {
        let id = DocumentId::new("team/board");
        assert_eq!(id.topic(), "team/board");
        assert_eq!(id.to_string(), "team/board");
        assert_eq!(DocumentId::from("team/board"), id);
    }
}
