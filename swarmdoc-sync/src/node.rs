//! A peer in the swarm: the registry of open document replicas.
//!
//! Every replica a node opens shares the node's CRDT adapter, content store
//! and pubsub endpoint. Replicas are keyed by [`DocumentId`]; operations on
//! an id that is not open fail with [`SyncError::NotOpen`] and touch no
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::config::NodeConfig;
use crate::crdt::Crdt;
use crate::error::SyncError;
use crate::protocol::{DocumentId, PeerId};
use crate::pubsub::{PeerEvent, PubSub};
use crate::replica::{DocumentReplica, LocalChange};
use crate::store::ContentStore;
use crate::subscribers::OriginFilter;

pub struct SwarmNode<C: Crdt> {
    config: NodeConfig,
    crdt: Arc<C>,
    store: Arc<dyn ContentStore>,
    pubsub: Arc<dyn PubSub>,
    /// document id → open replica
    replicas: RwLock<HashMap<DocumentId, DocumentReplica<C>>>,
}

impl<C: Crdt> SwarmNode<C> {
    pub fn new(
        config: NodeConfig,
        crdt: C,
        store: Arc<dyn ContentStore>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        log::info!("Swarm node {} starting", pubsub.peer_id());
        Self {
            config,
            crdt: Arc::new(crdt),
            store,
            pubsub,
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// Open `id`, subscribing its replica to the document topic.
    ///
    /// Opening an id that is already open returns the existing replica.
    pub async fn open(&self, id: impl Into<DocumentId>) -> Result<DocumentReplica<C>, SyncError> {
        let id = id.into();
        let mut replicas = self.replicas.write().await;
        if let Some(replica) = replicas.get(&id) {
            return Ok(replica.clone());
        }

        let replica = DocumentReplica::open(
            id.clone(),
            self.config.clone(),
            self.crdt.clone(),
            self.store.clone(),
            self.pubsub.clone(),
        )
        .await?;
        replicas.insert(id, replica.clone());
        Ok(replica)
    }

    /// Unsubscribe and discard the replica for `id`.
    pub async fn close(&self, id: &DocumentId) -> Result<(), SyncError> {
        let replica = self
            .replicas
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SyncError::NotOpen(id.clone()))?;
        replica.close().await
    }

    pub async fn replica(&self, id: &DocumentId) -> Option<DocumentReplica<C>> {
        self.replicas.read().await.get(id).cloned()
    }

    pub async fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.replicas.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_open(&self, id: &DocumentId) -> bool {
        self.replicas.read().await.contains_key(id)
    }

    /// Apply a local edit to the open document `id`.
    pub async fn change<F>(
        &self,
        id: &DocumentId,
        mutator: F,
        message: Option<&str>,
    ) -> Result<LocalChange<C::Document>, SyncError>
    where
        F: FnOnce(&mut C::Editor) + Send,
    {
        self.require(id).await?.change(mutator, message).await
    }

    pub async fn subscribe<F>(
        &self,
        id: &DocumentId,
        subscriber_id: impl Into<String>,
        handler: F,
        filter: OriginFilter,
    ) -> Result<(), SyncError>
    where
        F: Fn(&C::Document) + Send + Sync + 'static,
    {
        self.require(id).await?.subscribe(subscriber_id, handler, filter)
    }

    pub async fn unsubscribe(&self, id: &DocumentId, subscriber_id: &str) -> Result<bool, SyncError> {
        self.require(id).await?.unsubscribe(subscriber_id)
    }

    pub fn peer_id(&self) -> PeerId {
        self.pubsub.peer_id()
    }

    /// Peer joins and leaves on the topics of open documents.
    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.pubsub.peer_events()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Close every open replica.
    pub async fn shutdown(&self) {
        let replicas: Vec<DocumentReplica<C>> =
            self.replicas.write().await.drain().map(|(_, r)| r).collect();
        for replica in replicas {
            if let Err(e) = replica.close().await {
                log::warn!("Failed to close document {}: {e}", replica.id());
            }
        }
        log::info!("Swarm node {} stopped", self.peer_id());
    }

    async fn require(&self, id: &DocumentId) -> Result<DocumentReplica<C>, SyncError> {
        self.replica(id)
            .await
            .ok_or_else(|| SyncError::NotOpen(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsCrdt;
    use crate::pubsub::MemoryNetwork;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yrs::Any;

    fn node(network: &MemoryNetwork, store: &MemoryStore) -> SwarmNode<YrsCrdt> {
        SwarmNode::new(
            NodeConfig::for_testing(),
            YrsCrdt::new(),
            Arc::new(store.clone()),
            Arc::new(network.endpoint()),
        )
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let network = MemoryNetwork::new(16);
        let node = node(&network, &MemoryStore::new());

        let first = node.open("notes").await.unwrap();
        first.change(|m| m.set("x", Any::Number(1.0)), None).await.unwrap();
        let again = node.open("notes").await.unwrap();

        assert_eq!(again.document().get("x"), Some(&Any::Number(1.0)));
        assert_eq!(node.open_documents().await, vec![DocumentId::from("notes")]);
    }

    #[tokio::test]
    async fn test_close_discards_replica() {
        let network = MemoryNetwork::new(16);
        let node = node(&network, &MemoryStore::new());
        let id = DocumentId::from("notes");

        let replica = node.open(id.clone()).await.unwrap();
        node.close(&id).await.unwrap();

        assert!(!replica.is_open());
        assert!(!node.is_open(&id).await);
        assert!(node.replica(&id).await.is_none());
        assert_eq!(network.topics().topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_operations_on_unopened_document() {
        let network = MemoryNetwork::new(16);
        let node = node(&network, &MemoryStore::new());
        let id = DocumentId::from("missing");

        assert!(matches!(node.close(&id).await, Err(SyncError::NotOpen(_))));
        assert!(matches!(
            node.change(&id, |m| m.set("x", Any::Number(1.0)), None).await,
            Err(SyncError::NotOpen(_))
        ));
        assert!(matches!(
            node.subscribe(&id, "view", |_| {}, OriginFilter::All).await,
            Err(SyncError::NotOpen(_))
        ));
        assert!(matches!(
            node.unsubscribe(&id, "view").await,
            Err(SyncError::NotOpen(_))
        ));
        assert!(node.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_change_through_node_reaches_peer() {
        let network = MemoryNetwork::new(16);
        let store = MemoryStore::new();
        let alice = node(&network, &store);
        let bob = node(&network, &store);
        let id = DocumentId::from("notes");

        alice.open(id.clone()).await.unwrap();
        let bob_replica = bob.open(id.clone()).await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        bob.subscribe(
            &id,
            "view",
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            OriginFilter::Remote,
        )
        .await
        .unwrap();

        let change = alice
            .change(&id, |m| m.set("title", Any::from("hello")), None)
            .await
            .unwrap();
        assert!(change.is_propagated());

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !bob_replica.is_known(&change.change_id) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(bob_replica.document().get("title"), Some(&Any::from("hello")));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let network = MemoryNetwork::new(16);
        let node = node(&network, &MemoryStore::new());
        let notes = node.open("notes").await.unwrap();
        let board = node.open("board").await.unwrap();

        node.shutdown().await;

        assert!(!notes.is_open());
        assert!(!board.is_open());
        assert!(node.open_documents().await.is_empty());
    }
}
