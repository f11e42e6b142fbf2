//! Per-document synchronization engine.
//!
//! A [`DocumentReplica`] owns one document's merged snapshot, the set of
//! change ids it has absorbed, and its subscribers:
//!
//! ```text
//! inbound   pubsub ──► on_message ──► inline entries ──► merge ──► Remote handlers
//!                           │
//!                           └──► absent & unknown ids ──► fetch task ──► verify
//!                                                            └──► merge ──► Local handlers
//!
//! outbound  change(f) ──► crdt.change ──► diff ──► install snapshot + known id
//!                              └──► store.put ──► publish {known: absent, new: inline}
//!                                                    └──► Local handlers
//! ```
//!
//! Delivery is at-least-once and unordered, so nothing here relies on
//! message order: merge is commutative and idempotent, and the known-change
//! set only decides whether an id still needs fetching.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await` or while a subscriber runs. Every merge reads the current
//! snapshot and installs its successor under that lock, so concurrent
//! fetches and local edits never lose each other's updates.
//!
//! Failures the engine absorbs (malformed messages, failed fetches, failed
//! propagation) are logged and sent on the [`SyncReport`] channel.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::crdt::Crdt;
use crate::error::{CrdtError, PubSubError, StoreError, SyncError};
use crate::protocol::{ChangeId, ChangeSet, DocumentId, PeerId, ProtocolError, SyncMessage};
use crate::pubsub::{MessageHandler, PubSub};
use crate::store::ContentStore;
use crate::subscribers::{Handler, Origin, OriginFilter, SubscriberRegistry};

/// A failure the replica absorbed instead of returning to a caller.
#[derive(Debug, Clone)]
pub enum SyncReport {
    /// Inbound bytes did not decode as a sync message
    MalformedMessage { from: PeerId, error: ProtocolError },
    /// The CRDT rejected a change set
    MergeFailed { id: ChangeId, error: CrdtError },
    /// Content store lookup errored or timed out
    FetchFailed { id: ChangeId, error: SyncError },
    /// Content store has no blob for an announced id
    FetchNotFound { id: ChangeId },
    /// Fetched bytes hash to a different id than requested
    ContentMismatch { expected: ChangeId, actual: ChangeId },
    /// A local change could not be stored
    StoreFailed { id: ChangeId, error: SyncError },
    /// A local change could not be published
    PublishFailed { id: ChangeId, error: SyncError },
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedMessage { from, error } => {
                write!(f, "Malformed message from {from}: {error}")
            }
            Self::MergeFailed { id, error } => {
                write!(f, "Merge of {} failed: {error}", id.short())
            }
            Self::FetchFailed { id, error } => {
                write!(f, "Fetch of {} failed: {error}", id.short())
            }
            Self::FetchNotFound { id } => write!(f, "Change {} not found", id.short()),
            Self::ContentMismatch { expected, actual } => write!(
                f,
                "Fetched {} but content hashes to {}",
                expected.short(),
                actual.short()
            ),
            Self::StoreFailed { id, error } => {
                write!(f, "Storing {} failed: {error}", id.short())
            }
            Self::PublishFailed { id, error } => {
                write!(f, "Publishing {} failed: {error}", id.short())
            }
        }
    }
}

/// Result of a local edit.
///
/// The document has advanced even when `stored` or `published` is an error.
#[derive(Debug, Clone)]
pub struct LocalChange<D> {
    pub document: D,
    pub change_id: ChangeId,
    pub stored: Result<(), SyncError>,
    pub published: Result<(), SyncError>,
}

impl<D> LocalChange<D> {
    /// Whether the change reached both the content store and the topic.
    pub fn is_propagated(&self) -> bool {
        self.stored.is_ok() && self.published.is_ok()
    }
}

/// Counters for monitoring replica health.
#[derive(Debug, Clone, Default)]
pub struct ReplicaStats {
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub inline_merges: u64,
    pub fetched_merges: u64,
    pub fetch_failures: u64,
    pub local_changes: u64,
    pub store_failures: u64,
    pub publish_failures: u64,
}

#[derive(Default)]
struct AtomicReplicaStats {
    messages_received: AtomicU64,
    malformed_messages: AtomicU64,
    inline_merges: AtomicU64,
    fetched_merges: AtomicU64,
    fetch_failures: AtomicU64,
    local_changes: AtomicU64,
    store_failures: AtomicU64,
    publish_failures: AtomicU64,
}

impl AtomicReplicaStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReplicaStats {
        ReplicaStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            inline_merges: self.inline_merges.load(Ordering::Relaxed),
            fetched_merges: self.fetched_merges.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            local_changes: self.local_changes.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

struct ReplicaState<D> {
    document: D,
    /// Bumped every time `document` is replaced
    version: u64,
    /// Grows monotonically
    known: BTreeSet<ChangeId>,
    /// Ids with a fetch task outstanding
    in_flight: HashSet<ChangeId>,
}

struct ReplicaInner<C: Crdt> {
    id: DocumentId,
    config: NodeConfig,
    crdt: Arc<C>,
    store: Arc<dyn ContentStore>,
    pubsub: Arc<dyn PubSub>,
    state: Mutex<ReplicaState<C::Document>>,
    subscribers: Mutex<SubscriberRegistry<C::Document>>,
    fetches: Mutex<Vec<JoinHandle<()>>>,
    open: AtomicBool,
    reports: broadcast::Sender<SyncReport>,
    stats: AtomicReplicaStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases an id's in-flight slot when its fetch task ends or is aborted.
struct InFlight<C: Crdt> {
    inner: Arc<ReplicaInner<C>>,
    id: ChangeId,
}

impl<C: Crdt> Drop for InFlight<C> {
    fn drop(&mut self) {
        lock(&self.inner.state).in_flight.remove(&self.id);
    }
}

impl<C: Crdt> ReplicaInner<C> {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn report(&self, report: SyncReport) {
        log::warn!("Document {}: {report}", self.id);
        // No receivers is fine
        let _ = self.reports.send(report);
    }

    fn notify(&self, origin: Origin, document: &C::Document) {
        let handlers = lock(&self.subscribers).handlers(origin);
        for handler in handlers {
            handler(document);
        }
    }

    /// Merge `change` into the current snapshot and record `id` as known.
    /// Subscribers of `origin` see the result. Returns whether it merged.
    fn merge_change(&self, id: &ChangeId, change: &ChangeSet, origin: Origin) -> bool {
        let merged = {
            let mut state = lock(&self.state);
            // Liveness is checked under the lock so close() can't race a merge
            if !self.is_open() {
                return false;
            }
            self.crdt.merge(&state.document, change).map(|document| {
                state.document = document.clone();
                state.version += 1;
                state.known.insert(id.clone());
                document
            })
        };

        match merged {
            Ok(document) => {
                self.notify(origin, &document);
                true
            }
            Err(error) => {
                self.report(SyncReport::MergeFailed {
                    id: id.clone(),
                    error,
                });
                false
            }
        }
    }

    fn on_message(self: &Arc<Self>, from: PeerId, bytes: &[u8]) {
        AtomicReplicaStats::bump(&self.stats.messages_received);
        if !self.is_open() {
            log::debug!("Dropping message for closed document {}", self.id);
            return;
        }

        let message = match SyncMessage::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                AtomicReplicaStats::bump(&self.stats.malformed_messages);
                self.report(SyncReport::MalformedMessage { from, error });
                return;
            }
        };
        log::debug!(
            "Document {}: {} entries from {from}",
            self.id,
            message.len()
        );

        // Inline entries merge unconditionally; merge is idempotent
        for (id, change) in message.inline() {
            if self.merge_change(id, change, Origin::Remote) {
                AtomicReplicaStats::bump(&self.stats.inline_merges);
            }
        }

        let missing: Vec<ChangeId> = {
            let mut state = lock(&self.state);
            let ReplicaState {
                known, in_flight, ..
            } = &mut *state;
            message
                .absent()
                .filter(|id| !known.contains(*id) && in_flight.insert((*id).clone()))
                .cloned()
                .collect()
        };

        for id in missing {
            self.spawn_fetch(id);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, id: ChangeId) {
        let guard = InFlight {
            inner: self.clone(),
            id: id.clone(),
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                drop(guard);
                AtomicReplicaStats::bump(&self.stats.fetch_failures);
                self.report(SyncReport::FetchFailed {
                    id,
                    error: StoreError::Unavailable("no async runtime for fetch".into()).into(),
                });
                return;
            }
        };

        log::trace!("Document {}: fetching {}", self.id, id.short());
        let inner = self.clone();
        let task = handle.spawn(async move {
            let _guard = guard;
            inner.fetch_and_merge(id).await;
        });

        let mut fetches = lock(&self.fetches);
        fetches.retain(|t| !t.is_finished());
        fetches.push(task);
    }

    async fn fetch_and_merge(&self, id: ChangeId) {
        let after = self.config.store_timeout;
        let fetched = tokio::time::timeout(after, self.store.get(&id)).await;
        if !self.is_open() {
            return;
        }

        let bytes = match fetched {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                AtomicReplicaStats::bump(&self.stats.fetch_failures);
                self.report(SyncReport::FetchNotFound { id });
                return;
            }
            Ok(Err(e)) => {
                AtomicReplicaStats::bump(&self.stats.fetch_failures);
                self.report(SyncReport::FetchFailed { id, error: e.into() });
                return;
            }
            Err(_) => {
                AtomicReplicaStats::bump(&self.stats.fetch_failures);
                self.report(SyncReport::FetchFailed {
                    id,
                    error: SyncError::Timeout {
                        operation: "fetch",
                        after,
                    },
                });
                return;
            }
        };

        let change = ChangeSet::new(bytes);
        let actual = self.crdt.hash(&change);
        if actual != id {
            AtomicReplicaStats::bump(&self.stats.fetch_failures);
            self.report(SyncReport::ContentMismatch {
                expected: id,
                actual,
            });
            return;
        }

        if self.merge_change(&id, &change, Origin::Local) {
            AtomicReplicaStats::bump(&self.stats.fetched_merges);
        }
    }

    async fn change<F>(
        &self,
        mutator: F,
        message: Option<&str>,
    ) -> Result<LocalChange<C::Document>, SyncError>
    where
        F: FnOnce(&mut C::Editor) + Send,
    {
        if !self.is_open() {
            return Err(SyncError::Closed(self.id.clone()));
        }

        // The mutator runs without the state lock, so it may read the replica
        let (base, base_version) = {
            let state = lock(&self.state);
            (state.document.clone(), state.version)
        };
        let next = self.crdt.change(&base, mutator, message)?;
        let delta = self.crdt.diff(&base, &next)?;
        let change_id = self.crdt.hash(&delta);

        // The snapshot advances before any I/O
        let (document, announcement) = {
            let mut state = lock(&self.state);
            if !self.is_open() {
                return Err(SyncError::Closed(self.id.clone()));
            }
            // Something merged meanwhile: fold the delta into the newer snapshot
            let document = if state.version == base_version {
                next
            } else {
                self.crdt.merge(&state.document, &delta)?
            };
            let announcement =
                SyncMessage::announce(&state.known, change_id.clone(), delta.clone());
            state.document = document.clone();
            state.version += 1;
            state.known.insert(change_id.clone());
            (document, announcement)
        };
        AtomicReplicaStats::bump(&self.stats.local_changes);
        log::debug!("Document {}: local change {}", self.id, change_id.short());

        let stored = self.store_change(&change_id, delta).await;
        if let Err(error) = &stored {
            AtomicReplicaStats::bump(&self.stats.store_failures);
            self.report(SyncReport::StoreFailed {
                id: change_id.clone(),
                error: error.clone(),
            });
        }

        let published = self.publish(announcement).await;
        if let Err(error) = &published {
            AtomicReplicaStats::bump(&self.stats.publish_failures);
            self.report(SyncReport::PublishFailed {
                id: change_id.clone(),
                error: error.clone(),
            });
        }

        self.notify(Origin::Local, &document);

        Ok(LocalChange {
            document,
            change_id,
            stored,
            published,
        })
    }

    async fn store_change(&self, id: &ChangeId, delta: ChangeSet) -> Result<(), SyncError> {
        let after = self.config.store_timeout;
        match tokio::time::timeout(after, self.store.put(delta.into_bytes())).await {
            Ok(Ok(stored_id)) => {
                if &stored_id != id {
                    log::warn!(
                        "Document {}: store addressed {} as {}",
                        self.id,
                        id.short(),
                        stored_id.short()
                    );
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::Timeout {
                operation: "store",
                after,
            }),
        }
    }

    async fn publish(&self, announcement: SyncMessage) -> Result<(), SyncError> {
        let bytes = announcement.encode()?;
        let after = self.config.publish_timeout;
        match tokio::time::timeout(after, self.pubsub.publish(self.id.topic(), bytes)).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout {
                operation: "publish",
                after,
            }),
        }
    }
}

/// One open document. Clones share the same replica.
pub struct DocumentReplica<C: Crdt> {
    inner: Arc<ReplicaInner<C>>,
}

impl<C: Crdt> Clone for DocumentReplica<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Crdt> DocumentReplica<C> {
    /// Create a replica holding `crdt.init()`, not yet attached to its topic.
    pub fn new(
        id: DocumentId,
        config: NodeConfig,
        crdt: Arc<C>,
        store: Arc<dyn ContentStore>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        let document = crdt.init();
        Self {
            inner: Arc::new(ReplicaInner {
                id,
                config,
                crdt,
                store,
                pubsub,
                state: Mutex::new(ReplicaState {
                    document,
                    version: 0,
                    known: BTreeSet::new(),
                    in_flight: HashSet::new(),
                }),
                subscribers: Mutex::new(SubscriberRegistry::new()),
                fetches: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                reports,
                stats: AtomicReplicaStats::default(),
            }),
        }
    }

    /// Create a replica and subscribe it to its document topic.
    pub async fn open(
        id: DocumentId,
        config: NodeConfig,
        crdt: Arc<C>,
        store: Arc<dyn ContentStore>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self, SyncError> {
        let replica = Self::new(id, config, crdt, store, pubsub);
        replica.attach().await?;
        log::info!("Opened document {}", replica.inner.id);
        Ok(replica)
    }

    async fn attach(&self) -> Result<(), SyncError> {
        // The transport must not keep a closed replica alive
        let weak: Weak<ReplicaInner<C>> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |from: PeerId, data: Vec<u8>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(from, &data);
            }
        });
        self.inner
            .pubsub
            .subscribe(self.inner.id.topic(), handler)
            .await?;
        Ok(())
    }

    /// Process one delivered message. Never fails: problems are reported.
    ///
    /// Inline change sets merge before this returns. Ids announced without
    /// payload that are not yet known are fetched by background tasks.
    pub fn on_message(&self, from: PeerId, bytes: &[u8]) {
        self.inner.on_message(from, bytes);
    }

    /// Apply a local edit, then store and publish it.
    ///
    /// The returned document is installed before any I/O starts, and is
    /// kept even when storing or publishing fails.
    pub async fn change<F>(
        &self,
        mutator: F,
        message: Option<&str>,
    ) -> Result<LocalChange<C::Document>, SyncError>
    where
        F: FnOnce(&mut C::Editor) + Send,
    {
        self.inner.change(mutator, message).await
    }

    /// Register `handler` under `subscriber_id`, overwriting its previous
    /// handler in the scopes `filter` covers.
    pub fn subscribe<F>(
        &self,
        subscriber_id: impl Into<String>,
        handler: F,
        filter: OriginFilter,
    ) -> Result<(), SyncError>
    where
        F: Fn(&C::Document) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let handler: Handler<C::Document> = Arc::new(handler);
        lock(&self.inner.subscribers).insert(subscriber_id, handler, filter);
        Ok(())
    }

    /// Remove both registrations of `subscriber_id`.
    pub fn unsubscribe(&self, subscriber_id: &str) -> Result<bool, SyncError> {
        self.ensure_open()?;
        Ok(lock(&self.inner.subscribers).remove(subscriber_id))
    }

    /// Current snapshot.
    pub fn document(&self) -> C::Document {
        lock(&self.inner.state).document.clone()
    }

    /// Known change ids in sorted order.
    pub fn known_changes(&self) -> Vec<ChangeId> {
        lock(&self.inner.state).known.iter().cloned().collect()
    }

    pub fn is_known(&self, id: &ChangeId) -> bool {
        lock(&self.inner.state).known.contains(id)
    }

    pub fn id(&self) -> &DocumentId {
        &self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Stream of absorbed failures.
    pub fn reports(&self) -> broadcast::Receiver<SyncReport> {
        self.inner.reports.subscribe()
    }

    pub fn stats(&self) -> ReplicaStats {
        self.inner.stats.snapshot()
    }

    /// Number of fetches still outstanding.
    pub fn pending_fetches(&self) -> usize {
        lock(&self.inner.state).in_flight.len()
    }

    /// Wait until every outstanding fetch has finished.
    pub async fn settle(&self) {
        loop {
            let pending = std::mem::take(&mut *lock(&self.inner.fetches));
            if pending.is_empty() {
                break;
            }
            for task in pending {
                let _ = task.await;
            }
        }
    }

    /// Unsubscribe from the topic and discard the replica.
    ///
    /// Outstanding fetches are aborted; none of them merges or notifies
    /// after this returns.
    pub async fn close(&self) -> Result<(), SyncError> {
        {
            // Taking the state lock orders the flip after any running merge
            let _state = lock(&self.inner.state);
            if !self.inner.open.swap(false, Ordering::AcqRel) {
                return Err(SyncError::Closed(self.inner.id.clone()));
            }
        }

        let fetches = std::mem::take(&mut *lock(&self.inner.fetches));
        for task in fetches {
            task.abort();
            let _ = task.await;
        }
        lock(&self.inner.subscribers).clear();

        let result = match self.inner.pubsub.unsubscribe(self.inner.id.topic()).await {
            Ok(()) | Err(PubSubError::NotSubscribed(_)) => Ok(()),
            Err(e) => Err(e.into()),
        };
        log::info!("Closed document {}", self.inner.id);
        result
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(SyncError::Closed(self.inner.id.clone()))
        }
    }
}
