//! WebSocket relay providing topic-scoped pubsub between nodes.
//!
//! Architecture:
//! ```text
//! Node A ──┐                     ┌── forwarder ──► Node A
//!          ├── Subscribe(topic) ─┤
//! Node B ──┘        │            └── forwarder ──► Node B
//!                   ▼
//!            TopicGroup (broadcast) ◄── Publish(topic, data)
//! ```
//!
//! The relay never decodes publish payloads. It routes encoded frames by
//! topic and tells subscribers when peers join or leave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::{Frame, FrameType, PeerId};
use crate::pubsub::TopicManager;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    topics: Arc<TopicManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let topics = Arc::new(TopicManager::new(config.broadcast_capacity));
        Self {
            config,
            topics,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, topics, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    topics: Arc<TopicManager>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Identity is learned from the first frame the peer sends
    let mut peer_id: Option<PeerId> = None;
    // topic → forwarder task
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(config.broadcast_capacity);

    let result = async {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let pid = *peer_id.get_or_insert(frame.peer_id);
                            // The connection is bound to the first id it used
                            if frame.peer_id != pid {
                                log::warn!(
                                    "Dropping frame from {addr} claiming peer {} (bound to {pid})",
                                    frame.peer_id
                                );
                                continue;
                            }

                            match frame.frame_type {
                                FrameType::Subscribe => {
                                    let group = topics.get_or_create(&frame.topic).await;
                                    if !group.has_peer(&pid).await
                                        && group.peer_count().await >= config.max_peers_per_topic
                                    {
                                        log::warn!(
                                            "Topic {} is full, rejecting peer {pid}",
                                            frame.topic
                                        );
                                        continue;
                                    }

                                    let existing = group.peers().await;
                                    let rx = group.add_peer(pid).await;
                                    for other in existing.into_iter().filter(|p| *p != pid) {
                                        let joined = Frame::peer_joined(other, frame.topic.as_str());
                                        ws_sender.send(Message::Binary(joined.encode()?.into())).await?;
                                    }
                                    group.broadcast(&Frame::peer_joined(pid, frame.topic.as_str()))?;

                                    let task = tokio::spawn(forward(pid, rx, out_tx.clone()));
                                    if let Some(previous) = subscriptions.insert(frame.topic.clone(), task) {
                                        previous.abort();
                                    }
                                    stats.write().await.active_topics = topics.topic_count().await;
                                    log::info!("Peer {pid} subscribed to {}", frame.topic);
                                }

                                FrameType::Unsubscribe => {
                                    if let Some(task) = subscriptions.remove(&frame.topic) {
                                        task.abort();
                                        leave_topic(&topics, pid, &frame.topic).await;
                                        stats.write().await.active_topics = topics.topic_count().await;
                                    }
                                }

                                FrameType::Publish => {
                                    // Forward the already-encoded frame as is
                                    match topics.get(&frame.topic).await {
                                        Some(group) => {
                                            group.broadcast_raw(Arc::new(bytes));
                                        }
                                        None => log::trace!("Publish to empty topic {}", frame.topic),
                                    }
                                }

                                FrameType::Ping => {
                                    let pong = Frame::pong(Uuid::nil());
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                other => {
                                    log::debug!("Unhandled frame type from {addr}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frames forwarded from subscribed topics
                Some(data) = out_rx.recv() => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    // Cleanup: leave every topic this connection joined
    if let Some(pid) = peer_id {
        for (topic, task) in subscriptions.drain() {
            task.abort();
            leave_topic(&topics, pid, &topic).await;
        }
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_topics = topics.topic_count().await;
    }

    result
}

/// Copy a topic's frames into the connection's outgoing queue, skipping the
/// peer's own frames.
async fn forward(
    peer_id: PeerId,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok(data) => {
                if let Ok(frame) = Frame::decode(&data) {
                    if frame.peer_id == peer_id {
                        continue;
                    }
                }
                if out_tx.send(data).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {peer_id} lagged by {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn leave_topic(topics: &TopicManager, peer_id: PeerId, topic: &str) {
    if let Some(group) = topics.get(topic).await {
        group.remove_peer(&peer_id).await;
        if let Err(e) = group.broadcast(&Frame::peer_left(peer_id, topic)) {
            log::warn!("Failed to announce departure of {peer_id}: {e}");
        }
    }
    if topics.remove_if_empty(topic).await {
        log::info!("Topic {topic} removed (empty)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_creation() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9191");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_topics, 0);
    }

    #[tokio::test]
    async fn test_forward_skips_own_frames() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let task = tokio::spawn(forward(own, rx, out_tx));

        tx.send(Arc::new(Frame::publish(own, "notes", vec![1]).encode().unwrap())).unwrap();
        let theirs = Frame::publish(other, "notes", vec![2]);
        tx.send(Arc::new(theirs.encode().unwrap())).unwrap();

        let data = out_rx.recv().await.unwrap();
        assert_eq!(Frame::decode(&data).unwrap(), theirs);
        task.abort();
    }

    #[tokio::test]
    async fn test_leave_topic_removes_empty_group() {
        let topics = TopicManager::new(8);
        let peer = Uuid::new_v4();
        let group = topics.get_or_create("notes").await;
        let _rx = group.add_peer(peer).await;

        leave_topic(&topics, peer, "notes").await;
        assert_eq!(topics.topic_count().await, 0);
    }
}
