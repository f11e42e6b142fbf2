//! Per-document change subscribers, keyed by subscriber id.
//!
//! Each id holds at most one handler per origin. Registering an id again
//! overwrites its handler in the scopes the new filter covers and leaves
//! the other scope alone.

use std::collections::HashMap;
use std::sync::Arc;

/// Where a document update came from, as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Change set a peer pushed inline
    Remote,
    /// Local edit, or a change set fetched from the content store
    Local,
}

/// Which origins a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginFilter {
    #[default]
    All,
    Remote,
    Local,
}

impl OriginFilter {
    pub fn includes(self, origin: Origin) -> bool {
        matches!(
            (self, origin),
            (Self::All, _) | (Self::Remote, Origin::Remote) | (Self::Local, Origin::Local)
        )
    }
}

/// Callback receiving the new document snapshot.
pub type Handler<D> = Arc<dyn Fn(&D) + Send + Sync>;

/// Subscriber id → handler, one map per origin.
pub struct SubscriberRegistry<D> {
    remote: HashMap<String, Handler<D>>,
    local: HashMap<String, Handler<D>>,
}

impl<D> SubscriberRegistry<D> {
    pub fn new() -> Self {
        Self {
            remote: HashMap::new(),
            local: HashMap::new(),
        }
    }

    /// Register `handler` under `id` for every origin `filter` includes.
    pub fn insert(&mut self, id: impl Into<String>, handler: Handler<D>, filter: OriginFilter) {
        let id = id.into();
        if filter.includes(Origin::Remote) {
            self.remote.insert(id.clone(), handler.clone());
        }
        if filter.includes(Origin::Local) {
            self.local.insert(id, handler);
        }
    }

    /// Drop both registrations of `id`. Returns whether any existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let remote = self.remote.remove(id).is_some();
        let local = self.local.remove(id).is_some();
        remote || local
    }

    /// Handlers to invoke for an update of the given origin. No order is
    /// promised between them.
    pub fn handlers(&self, origin: Origin) -> Vec<Handler<D>> {
        self.scope(origin).values().cloned().collect()
    }

    pub fn contains(&self, id: &str, origin: Origin) -> bool {
        self.scope(origin).contains_key(id)
    }

    /// Number of distinct subscriber ids.
    pub fn len(&self) -> usize {
        self.remote.len()
            + self
                .local
                .keys()
                .filter(|id| !self.remote.contains_key(*id))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }

    pub fn clear(&mut self) {
        self.remote.clear();
        self.local.clear();
    }

    fn scope(&self, origin: Origin) -> &HashMap<String, Handler<D>> {
        match origin {
            Origin::Remote => &self.remote,
            Origin::Local => &self.local,
        }
    }
}

impl<D> Default for SubscriberRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
