//! CRDT adapter boundary and its Yrs implementation.
//!
//! The engine only needs five operations from a mergeable document type:
//! `init`, `change`, `diff`, `merge` and `hash`. Documents are immutable
//! snapshots: every `change` or `merge` returns a new value and leaves the
//! input untouched, so a reader holding an older snapshot is never affected
//! by a concurrent merge.
//!
//! [`YrsCrdt`] keeps each snapshot as a full Yrs v1 update plus a
//! materialized view of the root map:
//!
//! ```text
//! YrsDocument ── state:   Arc<[u8]>            (merge_updates_v1 of everything absorbed)
//!             └─ entries: Arc<BTreeMap<..>>    (root map, read-only view)
//!
//! merge(doc, cs):  state' = merge_updates_v1(doc.state, cs)
//!                  entries' = Doc ◄─ apply(doc.state) ◄─ apply(cs)
//! diff(old, new):  new.encode_state_as_update_v1(old.state_vector)
//! ```
//!
//! The state is merged at the byte level rather than re-encoded from the
//! integrated `Doc`, so a change that arrived before its causal
//! predecessors stays in the snapshot until they show up.

use std::collections::BTreeMap;
use std::sync::Arc;

use yrs::block::ClientID;
use yrs::updates::decoder::Decode;
use yrs::{merge_updates_v1, Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::CrdtError;
use crate::protocol::{ChangeId, ChangeSet};

/// Name of the Y.Map every document edits.
const ROOT_MAP: &str = "root";

/// A mergeable document engine.
///
/// `merge` must be commutative, associative and idempotent over the change
/// sets `diff` produces; the replica relies on that instead of ordering.
pub trait Crdt: Send + Sync + 'static {
    /// Immutable document snapshot. Cloning should be cheap.
    type Document: Clone + Send + Sync + 'static;
    /// Handle a mutator uses to describe its edits.
    type Editor;

    /// An empty document.
    fn init(&self) -> Self::Document;

    /// Apply `mutator` to a copy of `doc`. `mutator` must only describe
    /// edits; it may run against a snapshot that is about to be superseded.
    fn change<F>(
        &self,
        doc: &Self::Document,
        mutator: F,
        message: Option<&str>,
    ) -> Result<Self::Document, CrdtError>
    where
        F: FnOnce(&mut Self::Editor);

    /// Change set that turns `old` into `new`.
    fn diff(&self, old: &Self::Document, new: &Self::Document) -> Result<ChangeSet, CrdtError>;

    /// Fold `change` into `doc`, returning the merged snapshot.
    fn merge(&self, doc: &Self::Document, change: &ChangeSet) -> Result<Self::Document, CrdtError>;

    /// Content address of a change set.
    fn hash(&self, change: &ChangeSet) -> ChangeId {
        ChangeId::of(change.as_bytes())
    }
}

/// Snapshot of a Yrs-backed document.
#[derive(Debug, Clone)]
pub struct YrsDocument {
    state: Arc<[u8]>,
    entries: Arc<BTreeMap<String, Any>>,
    message: Option<Arc<str>>,
}

impl YrsDocument {
    /// Value stored under `key` in the root map.
    pub fn get(&self, key: &str) -> Option<&Any> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All root map entries, ordered by key.
    pub fn entries(&self) -> &BTreeMap<String, Any> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full Yrs state encoded as a v1 update.
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// Message attached to the local change that produced this snapshot.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Content equality: two snapshots are equal when their root maps are.
impl PartialEq for YrsDocument {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// Mutation handle over the root map, passed to `change` mutators.
pub struct MapEditor {
    doc: Doc,
    root: MapRef,
}

impl MapEditor {
    pub fn set(&mut self, key: &str, value: impl Into<Any>) {
        let mut txn = self.doc.transact_mut();
        self.root.insert(&mut txn, key, value.into());
    }

    /// Remove `key`, returning the previous value if it was a plain value.
    pub fn remove(&mut self, key: &str) -> Option<Any> {
        let mut txn = self.doc.transact_mut();
        self.root.remove(&mut txn, key).and_then(into_any)
    }

    pub fn get(&self, key: &str) -> Option<Any> {
        let txn = self.doc.transact();
        self.root.get(&txn, key).and_then(into_any)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let txn = self.doc.transact();
        self.root.contains_key(&txn, key)
    }
}

fn into_any(out: Out) -> Option<Any> {
    match out {
        Out::Any(any) => Some(any),
        _ => None,
    }
}

/// [`Crdt`] implementation over Yrs, editing a single root map.
///
/// All documents produced by one instance share its client id, so one
/// instance should be used per peer.
///
/// Snapshots carry no live `Doc`: `change`, `diff` and `merge` each rebuild
/// one from the encoded state, so every merge costs time linear in the
/// document's history. Inbound inline merges pay that cost on the transport's
/// delivery task.
pub struct YrsCrdt {
    client_id: ClientID,
}

impl YrsCrdt {
    /// Create an adapter with a fresh random client id.
    pub fn new() -> Self {
        Self {
            client_id: Doc::new().client_id(),
        }
    }

    pub fn client_id(&self) -> ClientID {
        self.client_id
    }

    /// Rebuild a Yrs doc from an encoded state.
    fn load(&self, state: &[u8]) -> Result<Doc, CrdtError> {
        let doc = Doc::with_client_id(self.client_id);
        let update = Update::decode_v1(state)?;
        doc.transact_mut()
            .apply_update(update)
            .map_err(|e| CrdtError::Apply(e.to_string()))?;
        Ok(doc)
    }

    /// Pair an encoded state with the root map view of `doc`.
    fn snapshot(&self, doc: &Doc, state: Vec<u8>, message: Option<&str>) -> YrsDocument {
        let txn = doc.transact();
        let entries = match txn.get_map(ROOT_MAP) {
            Some(root) => root
                .iter(&txn)
                .filter_map(|(key, value)| into_any(value).map(|v| (key.to_string(), v)))
                .collect(),
            None => BTreeMap::new(),
        };
        YrsDocument {
            state: state.into(),
            entries: Arc::new(entries),
            message: message.map(Arc::from),
        }
    }
}

impl Default for YrsCrdt {
    fn default() -> Self {
        Self::new()
    }
}

impl Crdt for YrsCrdt {
    type Document = YrsDocument;
    type Editor = MapEditor;

    fn init(&self) -> YrsDocument {
        let doc = Doc::with_client_id(self.client_id);
        let state = doc.transact().encode_state_as_update_v1(&StateVector::default());
        self.snapshot(&doc, state, None)
    }

    fn change<F>(
        &self,
        doc: &YrsDocument,
        mutator: F,
        message: Option<&str>,
    ) -> Result<YrsDocument, CrdtError>
    where
        F: FnOnce(&mut MapEditor),
    {
        let working = self.load(doc.state())?;
        let before = working.transact().state_vector();
        let root = working.get_or_insert_map(ROOT_MAP);
        let mut editor = MapEditor { doc: working, root };
        mutator(&mut editor);

        let local = editor.doc.transact().encode_state_as_update_v1(&before);
        let state = merge_updates_v1(&[doc.state(), local.as_slice()])?;
        Ok(self.snapshot(&editor.doc, state, message))
    }

    fn diff(&self, old: &YrsDocument, new: &YrsDocument) -> Result<ChangeSet, CrdtError> {
        let base = self.load(old.state())?;
        let base_sv = base.transact().state_vector();
        let target = self.load(new.state())?;
        let delta = target.transact().encode_state_as_update_v1(&base_sv);
        Ok(ChangeSet::new(delta))
    }

    fn merge(&self, doc: &YrsDocument, change: &ChangeSet) -> Result<YrsDocument, CrdtError> {
        let merged = self.load(doc.state())?;
        let update = Update::decode_v1(change.as_bytes())?;
        merged
            .transact_mut()
            .apply_update(update)
            .map_err(|e| CrdtError::Apply(e.to_string()))?;

        let state = merge_updates_v1(&[doc.state(), change.as_bytes()])?;
        Ok(self.snapshot(&merged, state, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(crdt: &YrsCrdt, doc: &YrsDocument, key: &str, value: f64) -> (YrsDocument, ChangeSet) {
        let next = crdt
            .change(doc, |m| m.set(key, Any::Number(value)), None)
            .unwrap();
        let delta = crdt.diff(doc, &next).unwrap();
        (next, delta)
    }

    #[test]
    fn test_init_is_empty() {
        let crdt = YrsCrdt::new();
        let doc = crdt.init();
        assert!(doc.is_empty());
        assert!(doc.message().is_none());
    }

    #[test]
    fn test_change_returns_new_snapshot() {
        let crdt = YrsCrdt::new();
        let doc = crdt.init();

        let next = crdt
            .change(&doc, |m| m.set("x", Any::Number(1.0)), Some("set x"))
            .unwrap();

        assert_eq!(next.get("x"), Some(&Any::Number(1.0)));
        assert_eq!(next.message(), Some("set x"));
        // The original snapshot is untouched
        assert!(doc.get("x").is_none());
    }

    #[test]
    fn test_editor_reads_own_writes() {
        let crdt = YrsCrdt::new();
        let doc = crdt
            .change(&crdt.init(), |m| m.set("title", "draft"), None)
            .unwrap();

        let next = crdt
            .change(
                &doc,
                |m| {
                    assert_eq!(m.get("title"), Some(Any::from("draft")));
                    assert!(m.contains_key("title"));
                    let old = m.remove("title");
                    assert_eq!(old, Some(Any::from("draft")));
                    m.set("status", true);
                },
                None,
            )
            .unwrap();

        assert!(!next.contains_key("title"));
        assert_eq!(next.get("status"), Some(&Any::Bool(true)));
    }

    #[test]
    fn test_diff_merge_converges() {
        let alice = YrsCrdt::new();
        let bob = YrsCrdt::new();

        let (a1, delta) = edit(&alice, &alice.init(), "x", 1.0);
        let b1 = bob.merge(&bob.init(), &delta).unwrap();

        assert_eq!(a1, b1);
        assert_eq!(b1.get("x"), Some(&Any::Number(1.0)));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let alice = YrsCrdt::new();
        let bob = YrsCrdt::new();

        let (_, delta) = edit(&alice, &alice.init(), "x", 1.0);
        let once = bob.merge(&bob.init(), &delta).unwrap();
        let twice = bob.merge(&once, &delta).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_concurrent_merges_commute() {
        let alice = YrsCrdt::new();
        let bob = YrsCrdt::new();
        let carol = YrsCrdt::new();
        let dave = YrsCrdt::new();
        let erin = YrsCrdt::new();

        let (_, from_alice) = edit(&alice, &alice.init(), "a", 1.0);
        let (_, from_bob) = edit(&bob, &bob.init(), "b", 2.0);
        // Same key edited concurrently: resolution must not depend on order
        let (_, from_dave) = edit(&dave, &dave.init(), "x", 3.0);
        let (_, from_erin) = edit(&erin, &erin.init(), "x", 4.0);

        let forward = [&from_alice, &from_bob, &from_dave, &from_erin]
            .iter()
            .fold(carol.init(), |doc, cs| carol.merge(&doc, cs).unwrap());
        let backward = [&from_erin, &from_dave, &from_bob, &from_alice]
            .iter()
            .fold(carol.init(), |doc, cs| carol.merge(&doc, cs).unwrap());

        assert_eq!(forward, backward);
        assert_eq!(forward.get("a"), Some(&Any::Number(1.0)));
        assert_eq!(forward.get("b"), Some(&Any::Number(2.0)));
        assert!(forward.contains_key("x"));
    }

    #[test]
    fn test_diff_only_contains_new_edit() {
        let alice = YrsCrdt::new();
        let bob = YrsCrdt::new();

        let (a1, d1) = edit(&alice, &alice.init(), "x", 1.0);
        let (_, d2) = edit(&alice, &a1, "x", 2.0);

        // Bob applies both deltas in order and sees the latest value
        let b = bob.merge(&bob.init(), &d1).unwrap();
        let b = bob.merge(&b, &d2).unwrap();
        assert_eq!(b.get("x"), Some(&Any::Number(2.0)));
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_change_ahead_of_its_dependency_is_kept() {
        let alice = YrsCrdt::new();
        let bob = YrsCrdt::new();

        let (a1, d1) = edit(&alice, &alice.init(), "x", 1.0);
        let (a2, d2) = edit(&alice, &a1, "y", 2.0);

        // d2 builds on d1; Bob sees it first
        let early = bob.merge(&bob.init(), &d2).unwrap();
        let done = bob.merge(&early, &d1).unwrap();

        assert_eq!(done, a2);
        assert_eq!(done.get("y"), Some(&Any::Number(2.0)));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let crdt = YrsCrdt::new();
        let (_, delta) = edit(&crdt, &crdt.init(), "x", 1.0);
        let copy = ChangeSet::new(delta.as_bytes().to_vec());

        assert_eq!(crdt.hash(&delta), crdt.hash(&copy));
        assert_eq!(crdt.hash(&delta), ChangeId::of(delta.as_bytes()));
    }

    #[test]
    fn test_merge_rejects_garbage() {
        let crdt = YrsCrdt::new();
        let garbage = ChangeSet::new(vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(crdt.merge(&crdt.init(), &garbage).is_err());
    }
}
