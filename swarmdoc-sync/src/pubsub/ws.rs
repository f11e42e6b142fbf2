//! WebSocket pubsub client for a [`RelayServer`](crate::relay::RelayServer).
//!
//! One socket carries every topic the node subscribes to:
//!
//! ```text
//! publish/subscribe ──► outgoing mpsc ──► writer task ──► WebSocket
//! WebSocket ──► reader task ──► Frame::decode ──► handlers[topic](from, data)
//!                                         └────► peer events
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{MessageHandler, PeerEvent, PubSub};
use crate::error::PubSubError;
use crate::protocol::{Frame, FrameType, PeerId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

type HandlerMap = Arc<std::sync::RwLock<HashMap<String, MessageHandler>>>;

/// Pubsub endpoint backed by a single WebSocket to a relay.
pub struct WsPubSub {
    peer_id: PeerId,
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// topic → handler, read by the reader task
    handlers: HandlerMap,
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,
    events: broadcast::Sender<PeerEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsPubSub {
    /// Connect to the relay at `url` under a random peer id.
    pub async fn connect(url: impl Into<String>) -> Result<Self, PubSubError> {
        Self::connect_with_id(url, Uuid::new_v4()).await
    }

    /// Connect to the relay at `url`.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect_with_id(
        url: impl Into<String>,
        peer_id: PeerId,
    ) -> Result<Self, PubSubError> {
        let url = url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *state.write().await = ConnectionState::Disconnected;
                return Err(PubSubError::Io(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: dispatch incoming frames by topic
        let handlers: HandlerMap = Arc::new(std::sync::RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let reader = {
            let handlers = handlers.clone();
            let events = events.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            match Frame::decode(&bytes) {
                                Ok(frame) => dispatch(peer_id, frame, &handlers, &events),
                                Err(e) => log::warn!("Failed to decode frame from relay: {e}"),
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost
                *state.write().await = ConnectionState::Disconnected;
                log::info!("Peer {peer_id} disconnected from relay");
            })
        };

        *state.write().await = ConnectionState::Connected;
        log::info!("Peer {peer_id} connected to {url}");

        Ok(Self {
            peer_id,
            url,
            state,
            handlers,
            outgoing_tx,
            events,
            reader,
            writer,
        })
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), PubSubError> {
        let encoded = frame.encode()?;
        self.outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| PubSubError::NotConnected)
    }

    /// Send a ping to the relay.
    pub async fn ping(&self) -> Result<(), PubSubError> {
        self.send_frame(&Frame::ping(self.peer_id)).await
    }

    /// Close the socket. Later publishes fail with `NotConnected`.
    pub async fn disconnect(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Topics with a registered handler.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

fn dispatch(
    own_id: PeerId,
    frame: Frame,
    handlers: &HandlerMap,
    events: &broadcast::Sender<PeerEvent>,
) {
    // Skip our own frames
    if frame.peer_id == own_id {
        return;
    }
    match frame.frame_type {
        FrameType::Publish => {
            let handler = handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&frame.topic)
                .cloned();
            match handler {
                Some(handler) => handler(frame.peer_id, frame.payload),
                None => log::trace!("No handler for topic {}", frame.topic),
            }
        }
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
        FrameType::Pong => log::trace!("Pong from relay"),
        other => log::debug!("Unhandled frame type from relay: {other:?}"),
    }
}

#[async_trait]
impl PubSub for WsPubSub {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), handler);
        self.send_frame(&Frame::subscribe(self.peer_id, topic)).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .ok_or_else(|| PubSubError::NotSubscribed(topic.to_string()))?;
        self.send_frame(&Frame::unsubscribe(self.peer_id, topic)).await
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(PubSubError::NotConnected);
        }
        self.send_frame(&Frame::publish(self.peer_id, topic, data)).await
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsPubSub {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handlers() -> (HandlerMap, Arc<Mutex<Vec<(PeerId, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |from: PeerId, data: Vec<u8>| {
            sink.lock().unwrap().push((from, data));
        });
        let mut map = HashMap::new();
        map.insert("notes".to_string(), handler);
        (Arc::new(std::sync::RwLock::new(map)), seen)
    }

    #[test]
    fn test_dispatch_routes_by_topic() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (handlers, seen) = recording_handlers();
        let (events, _) = broadcast::channel(8);

        dispatch(own, Frame::publish(other, "notes", vec![1]), &handlers, &events);
        dispatch(own, Frame::publish(other, "board", vec![2]), &handlers, &events);

        assert_eq!(*seen.lock().unwrap(), vec![(other, vec![1])]);
    }

    #[test]
    fn test_dispatch_skips_own_frames() {
        let own = Uuid::new_v4();
        let (handlers, seen) = recording_handlers();
        let (events, _) = broadcast::channel(8);

        dispatch(own, Frame::publish(own, "notes", vec![1]), &handlers, &events);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_peer_events() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (handlers, _) = recording_handlers();
        let (events, mut rx) = broadcast::channel(8);

        dispatch(own, Frame::peer_joined(other, "notes"), &handlers, &events);
        dispatch(own, Frame::peer_left(other, "notes"), &handlers, &events);

        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::Joined { topic: "notes".into(), peer_id: other }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::Left { topic: "notes".into(), peer_id: other }
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = WsPubSub::connect(format!("ws://127.0.0.1:{port}")).await;
        assert!(matches!(result, Err(PubSubError::Io(_))));
    }
}
