//! Fan-out of encoded frames to every subscriber of a topic.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; slower receivers lag and lose the oldest frames,
//! which the sync layer tolerates because announcements are redundant.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{Frame, PeerId, ProtocolError};

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the send path.
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicTopicStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Subscribers of a single topic sharing one broadcast channel.
pub struct TopicGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicTopicStats>,
}

impl TopicGroup {
    /// Create a new group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            atomic_stats: Arc::new(AtomicTopicStats::new()),
        }
    }

    /// Add a peer, returning its receiver.
    pub async fn add_peer(&self, peer_id: PeerId) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    /// Remove a peer. Returns whether it was present.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and broadcast a frame to every receiver, the sender's
    /// included; receivers filter their own frames.
    pub fn broadcast(&self, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        match self.sender.send(encoded) {
            Ok(count) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                // No live receivers
                self.atomic_stats
                    .messages_dropped
                    .fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.peers.read().await.iter().copied().collect()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    /// Get topic statistics (lock-free counters plus peer count).
    pub async fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to their groups so traffic stays isolated per topic.
pub struct TopicManager {
    topics: Arc<RwLock<HashMap<String, Arc<TopicGroup>>>>,
    default_capacity: usize,
}

impl TopicManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(group) = topics.get(topic) {
                return group.clone();
            }
        }

        // Slow path: double-check under the write lock
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            return group.clone();
        }

        let group = Arc::new(TopicGroup::new(self.default_capacity));
        topics.insert(topic.to_string(), group.clone());
        group
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Remove a topic with no peers left.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.peer_count().await == 0 {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
