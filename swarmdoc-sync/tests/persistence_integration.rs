//! Persistence integration tests.
//!
//! Verifies:
//! - Changes stored by a node survive a store restart
//! - A replica backed by a reopened store fetches announced history from disk
//! - Several nodes can share one RocksDB-backed store

use std::sync::Arc;

use swarmdoc_sync::{
    BlobStore, BlobStoreConfig, ChangeId, ContentStore, DocumentId, DocumentReplica,
    MemoryNetwork, NodeConfig, PubSub, SwarmNode, SyncMessage, YrsCrdt,
};
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;
use yrs::Any;

fn open_store(path: &std::path::Path) -> Arc<BlobStore> {
    Arc::new(BlobStore::open(BlobStoreConfig::for_testing(path)).unwrap())
}

#[tokio::test]
async fn test_changes_survive_store_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blobs");
    let id = DocumentId::from("notes");

    let (first, second) = {
        let network = MemoryNetwork::new(16);
        let store = open_store(&path);
        let node = SwarmNode::new(
            NodeConfig::for_testing(),
            YrsCrdt::new(),
            store.clone(),
            Arc::new(network.endpoint()),
        );
        node.open(id.clone()).await.unwrap();
        let first = node
            .change(&id, |m| m.set("x", Any::Number(1.0)), None)
            .await
            .unwrap();
        let second = node
            .change(&id, |m| m.set("y", Any::Number(2.0)), None)
            .await
            .unwrap();
        assert!(first.stored.is_ok() && second.stored.is_ok());
        store.sync().unwrap();
        node.shutdown().await;
        (first.change_id, second.change_id)
    };

    // Reopen from disk: a fresh replica learns both ids from an announcement
    let store = open_store(&path);
    assert_eq!(store.stats().blob_count, 2);

    let network = MemoryNetwork::new(16);
    let replica = DocumentReplica::new(
        id,
        NodeConfig::for_testing(),
        Arc::new(YrsCrdt::new()),
        store.clone(),
        Arc::new(network.endpoint()),
    );
    let mut announcement = SyncMessage::new();
    announcement.insert_absent(first.clone());
    announcement.insert_absent(second.clone());
    replica.on_message(Uuid::new_v4(), &announcement.encode().unwrap());
    replica.settle().await;

    let doc = replica.document();
    assert_eq!(doc.get("x"), Some(&Any::Number(1.0)));
    assert_eq!(doc.get("y"), Some(&Any::Number(2.0)));
    assert!(replica.is_known(&first));
    assert!(replica.is_known(&second));
    assert_eq!(replica.stats().fetched_merges, 2);
}

#[tokio::test]
async fn test_nodes_share_blob_store() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("blobs"));
    let network = MemoryNetwork::new(16);
    let id = DocumentId::from("board");

    let make_node = || {
        SwarmNode::new(
            NodeConfig::for_testing(),
            YrsCrdt::new(),
            store.clone() as Arc<dyn ContentStore>,
            Arc::new(network.endpoint()) as Arc<dyn PubSub>,
        )
    };
    let alice = make_node();
    alice.open(id.clone()).await.unwrap();
    alice.change(&id, |m| m.set("a", Any::Number(1.0)), None).await.unwrap();

    // Bob joins late and only hears about "a" through the next announcement
    let bob = make_node();
    let b = bob.open(id.clone()).await.unwrap();
    alice.change(&id, |m| m.set("b", Any::Number(2.0)), None).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while b.document().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    b.settle().await;
    assert_eq!(b.stats().fetched_merges, 1);

    let stats = store.stats();
    assert_eq!(stats.blob_count, 2);
    assert!(stats.stored_bytes > 0);
}

#[tokio::test]
async fn test_missing_blob_leaves_id_unknown() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("blobs"));
    let network = MemoryNetwork::new(16);
    let replica = DocumentReplica::new(
        DocumentId::from("notes"),
        NodeConfig::for_testing(),
        Arc::new(YrsCrdt::new()),
        store,
        Arc::new(network.endpoint()),
    );

    let missing = ChangeId::of(b"not on disk");
    let mut announcement = SyncMessage::new();
    announcement.insert_absent(missing.clone());
    replica.on_message(Uuid::new_v4(), &announcement.encode().unwrap());
    replica.settle().await;

    assert!(!replica.is_known(&missing));
    assert!(replica.document().is_empty());
    assert_eq!(replica.stats().fetch_failures, 1);
}
