//! In-process pubsub: every endpoint of one [`MemoryNetwork`] shares its
//! topic groups, so nodes in the same process form a swarm without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{MessageHandler, PeerEvent, PubSub, TopicManager};
use crate::error::PubSubError;
use crate::protocol::{Frame, FrameType, PeerId};

/// Shared in-process hub.
#[derive(Clone)]
pub struct MemoryNetwork {
    topics: Arc<TopicManager>,
    capacity: usize,
}

impl MemoryNetwork {
    /// `capacity` bounds the frames buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(TopicManager::new(capacity)),
            capacity,
        }
    }

    /// New endpoint with a random peer id.
    pub fn endpoint(&self) -> MemoryPubSub {
        self.endpoint_with_id(Uuid::new_v4())
    }

    pub fn endpoint_with_id(&self, peer_id: PeerId) -> MemoryPubSub {
        let (events, _) = broadcast::channel(self.capacity);
        MemoryPubSub {
            peer_id,
            topics: self.topics.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryPubSub {
    peer_id: PeerId,
    topics: Arc<TopicManager>,
    /// topic → delivery task
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl MemoryPubSub {
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError> {
        let group = self.topics.get_or_create(topic).await;
        let existing = group.peers().await;
        let mut rx = group.add_peer(self.peer_id).await;

        for peer_id in existing.into_iter().filter(|p| *p != self.peer_id) {
            let _ = self.events.send(PeerEvent::Joined {
                topic: topic.to_string(),
                peer_id,
            });
        }
        group.broadcast(&Frame::peer_joined(self.peer_id, topic))?;

        let own_id = self.peer_id;
        let events = self.events.clone();
        let topic_name = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => {
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame on {topic_name}: {e}");
                                continue;
                            }
                        };
                        // Skip our own frames
                        if frame.peer_id == own_id {
                            continue;
                        }
                        match frame.frame_type {
                            FrameType::Publish => handler(frame.peer_id, frame.payload),
                            FrameType::PeerJoined => {
                                let _ = events.send(PeerEvent::Joined {
                                    topic: frame.topic,
                                    peer_id: frame.peer_id,
                                });
                            }
                            FrameType::PeerLeft => {
                                let _ = events.send(PeerEvent::Left {
                                    topic: frame.topic,
                                    peer_id: frame.peer_id,
                                });
                            }
                            other => log::trace!("Ignoring {other:?} frame on {topic_name}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {own_id} lagged by {n} frames on {topic_name}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), task);
        if let Some(previous) = previous {
            previous.abort();
        }
        log::debug!("Peer {} subscribed to {topic}", self.peer_id);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .ok_or_else(|| PubSubError::NotSubscribed(topic.to_string()))?;
        task.abort();

        if let Some(group) = self.topics.get(topic).await {
            group.remove_peer(&self.peer_id).await;
            group.broadcast(&Frame::peer_left(self.peer_id, topic))?;
        }
        self.topics.remove_if_empty(topic).await;
        log::debug!("Peer {} unsubscribed from {topic}", self.peer_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        if let Some(group) = self.topics.get(topic).await {
            let receivers = group.broadcast(&Frame::publish(self.peer_id, topic, data))?;
            log::trace!("Published on {topic} to {receivers} receivers");
        }
        Ok(())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

impl Drop for MemoryPubSub {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    }
}
