//! # swarmdoc-sync: document replication over pubsub and content-addressed storage
//!
//! Each peer keeps a local replica of every document it has open, merges
//! remote edits as they arrive, and announces its own edits by publishing
//! the newest change inline together with the ids of every change it
//! already holds. Peers fetch any announced change they lack from the
//! content store. No peer is authoritative.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── SwarmNode ──────────────────────────┐
//! │  DocumentReplica("notes")    DocumentReplica("board")   ...   │
//! │   ├─ snapshot (CRDT)          ├─ snapshot                     │
//! │   ├─ known change ids         ├─ known change ids             │
//! │   └─ subscribers              └─ subscribers                  │
//! └───────┬───────────────────────────┬───────────────────────────┘
//!         │ publish / on_message      │ put / get
//!         ▼                           ▼
//! ┌───────────────┐            ┌───────────────┐
//! │ PubSub        │            │ ContentStore  │
//! │ memory │ ws ──┼──► Relay   │ memory │ blob │
//! └───────────────┘            └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: the per-document sync engine
//! - [`node`]: replica registry keyed by document id
//! - [`protocol`]: `SyncMessage` and relay `Frame` wire formats (bincode)
//! - [`crdt`]: CRDT adapter trait and its Yrs implementation
//! - [`store`]: content-addressed stores (in-memory, RocksDB)
//! - [`pubsub`]: topic transports (in-process, WebSocket)
//! - [`relay`]: WebSocket topic relay server
//! - [`subscribers`]: origin-filtered change subscribers

pub mod config;
pub mod crdt;
pub mod error;
pub mod node;
pub mod protocol;
pub mod pubsub;
pub mod relay;
pub mod replica;
pub mod store;
pub mod subscribers;

// Re-exports for convenience
pub use config::{BlobStoreConfig, NodeConfig, RelayConfig};
pub use crdt::{Crdt, MapEditor, YrsCrdt, YrsDocument};
pub use error::{CrdtError, PubSubError, StoreError, SyncError};
pub use node::SwarmNode;
pub use protocol::{
    ChangeId, ChangeSet, DocumentId, Frame, FrameType, PeerId, ProtocolError, SyncMessage,
};
pub use pubsub::{
    ConnectionState, MemoryNetwork, MemoryPubSub, MessageHandler, PeerEvent, PubSub, WsPubSub,
};
pub use relay::{RelayServer, RelayStats};
pub use replica::{DocumentReplica, LocalChange, ReplicaStats, SyncReport};
pub use store::{BlobStore, ContentStore, MemoryStore};
pub use subscribers::{Origin, OriginFilter};
