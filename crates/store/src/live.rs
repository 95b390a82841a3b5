use std::sync::Arc;

use kite_core::{ChangeEvent, NamespaceScope, Resource, ResourceKey};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Outcome of merging a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// Delete for a key that is not present.
    Ignored,
    /// Added/Modified for a namespace outside the active scope.
    OutOfScope,
}

impl Applied {
    pub fn changed(self) -> bool { matches!(self, Applied::Inserted | Applied::Replaced | Applied::Removed) }
}

/// Ordered, key-unique collection that change events are merged into.
///
/// Upserts replace in place so rows do not jump; new keys are appended.
/// `index` maps every key to its slot in `items`.
pub struct LiveList<T> {
    epoch: u64,
    items: Vec<T>,
    index: FxHashMap<ResourceKey, usize>,
    scope: Option<NamespaceScope>,
}

impl<T: Resource> Default for LiveList<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Resource> LiveList<T> {
    pub fn new() -> Self { Self { epoch: 0, items: Vec::new(), index: FxHashMap::default(), scope: None } }

    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn items(&self) -> &[T] { &self.items }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn scope(&self) -> Option<&NamespaceScope> { self.scope.as_ref() }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.index.contains_key(key) }

    fn admits(&self, item: &T) -> bool {
        self.scope.as_ref().map(|s| s.admits(item.namespace())).unwrap_or(true)
    }

    /// Re-point index entries for every slot from `from` on.
    fn reindex_from(&mut self, from: usize) {
        for (i, it) in self.items.iter().enumerate().skip(from) {
            self.index.insert(it.key(), i);
        }
    }

    fn upsert(&mut self, item: T) -> Applied {
        match self.index.get(&item.key()) {
            Some(&idx) => {
                self.items[idx] = item;
                Applied::Replaced
            }
            None => {
                self.index.insert(item.key(), self.items.len());
                self.items.push(item);
                Applied::Inserted
            }
        }
    }

    fn remove(&mut self, key: &ResourceKey) -> bool {
        match self.index.remove(key) {
            Some(idx) => {
                self.items.remove(idx);
                self.reindex_from(idx);
                true
            }
            None => false,
        }
    }

    /// Replace the whole collection (initial list or relist) and set the active scope.
    /// Out-of-scope entries are dropped and duplicate keys collapse into the first slot.
    pub fn reset(&mut self, items: Vec<T>, scope: Option<NamespaceScope>) {
        self.scope = scope;
        self.items.clear();
        self.index.clear();
        for it in items {
            if self.admits(&it) {
                self.upsert(it);
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Merge one change event.
    pub fn apply(&mut self, event: ChangeEvent<T>) -> Applied {
        let out = match event {
            ChangeEvent::Added(o) | ChangeEvent::Modified(o) => {
                if !self.admits(&o) {
                    trace!(key = %o.key(), "live: event outside scope dropped");
                    return Applied::OutOfScope;
                }
                self.upsert(o)
            }
            ChangeEvent::Deleted(o) => {
                if self.remove(&o.key()) { Applied::Removed } else { Applied::Ignored }
            }
        };
        if out.changed() {
            self.epoch = self.epoch.saturating_add(1);
        }
        out
    }

    /// Put a locally created entity at the front if it is in scope and its key is new.
    pub fn insert_front(&mut self, item: T) -> bool {
        if !self.admits(&item) || self.contains(&item.key()) {
            return false;
        }
        self.items.insert(0, item);
        self.reindex_from(0);
        self.epoch = self.epoch.saturating_add(1);
        true
    }

    /// Replace an existing entry in place; never inserts.
    pub fn replace_existing(&mut self, item: T) -> bool {
        match self.index.get(&item.key()) {
            Some(&idx) => {
                self.items[idx] = item;
                self.epoch = self.epoch.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub fn freeze(&self) -> Arc<Vec<T>> { Arc::new(self.items.clone()) }
}
