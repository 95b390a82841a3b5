use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kite_core::{ChangeEvent, NamespaceScope, Resource, ResourceKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Identity of a cached collection: cluster context + kind + namespace scope.
/// `scope == None` is a cluster-scoped kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub context: Option<String>,
    pub gvk: String,
    pub scope: Option<NamespaceScope>,
}

impl CacheKey {
    pub fn new(context: Option<&str>, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> Self {
        Self { context: context.map(str::to_string), gvk: kind.gvk_key(), scope: scope.cloned() }
    }
}

/// A cached list result and the instant after which it is stale.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot<T> {
    pub items: Vec<T>,
    pub expires_at: Instant,
}

impl<T> CollectionSnapshot<T> {
    fn is_expired(&self, now: Instant) -> bool { now >= self.expires_at }
}

/// Keyed snapshot store with per-entry expiry.
///
/// Readers always receive an owned copy, so merges performed by a view never
/// touch the cached value. Expired entries are evicted by the read that finds them.
pub struct SnapshotCache<T> {
    entries: Mutex<FxHashMap<CacheKey, CollectionSnapshot<T>>>,
}

impl<T> Default for SnapshotCache<T> {
    fn default() -> Self { Self { entries: Mutex::new(FxHashMap::default()) } }
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, CollectionSnapshot<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<T>> {
        let now = Instant::now();
        let mut map = self.lock();
        match map.get(key) {
            Some(snap) if !snap.is_expired(now) => {
                counter!("kite_cache_hits_total", 1);
                Some(snap.items.clone())
            }
            Some(_) => {
                map.remove(key);
                counter!("kite_cache_evictions_total", 1);
                counter!("kite_cache_misses_total", 1);
                debug!(gvk = %key.gvk, "cache: expired entry evicted");
                None
            }
            None => {
                counter!("kite_cache_misses_total", 1);
                None
            }
        }
    }

    pub fn put(&self, key: CacheKey, items: Vec<T>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        debug!(gvk = %key.gvk, items = items.len(), ttl_ms = %ttl.as_millis(), "cache: put");
        self.lock().insert(key, CollectionSnapshot { items, expires_at });
    }

    /// Remove an entry regardless of freshness. Returns whether one was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry belonging to one cluster context.
    pub fn invalidate_context(&self, context: Option<&str>) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| k.context.as_deref() != context);
        let removed = before - map.len();
        if removed > 0 {
            debug!(context = ?context, removed, "cache: context invalidated");
        }
        removed
    }

    /// Sweep expired entries without waiting for a read to find them.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, s| !s.is_expired(now));
        let removed = before - map.len();
        if removed > 0 {
            counter!("kite_cache_evictions_total", removed as u64);
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<T: Resource> SnapshotCache<T> {
    /// Fold a change event into every fresh snapshot of `context`/`gvk` whose
    /// scope admits it. Expiry is left untouched. Returns how many snapshots changed.
    pub fn merge_event(&self, context: Option<&str>, gvk: &str, event: &ChangeEvent<T>) -> usize {
        let now = Instant::now();
        let obj = event.object();
        let obj_key = obj.key();
        let mut map = self.lock();
        let mut changed = 0;
        for (key, snap) in map.iter_mut() {
            if key.context.as_deref() != context || key.gvk != gvk || snap.is_expired(now) {
                continue;
            }
            let pos = snap.items.iter().position(|x| x.has_key(&obj_key));
            match event {
                ChangeEvent::Added(o) | ChangeEvent::Modified(o) => {
                    if !key.scope.as_ref().map(|s| s.admits(o.namespace())).unwrap_or(true) {
                        continue;
                    }
                    match pos {
                        Some(i) => snap.items[i] = o.clone(),
                        None => snap.items.push(o.clone()),
                    }
                }
                ChangeEvent::Deleted(_) => match pos {
                    Some(i) => {
                        snap.items.remove(i);
                    }
                    None => continue,
                },
            }
            changed += 1;
        }
        if changed > 0 {
            debug!(gvk = %gvk, key = %obj_key, event = event.label(), snapshots = changed, "cache: event merged");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::LiteObj;

    fn key(ctx: &str, ns: Option<&str>) -> CacheKey {
        let kind = ResourceKind::new("", "v1", "ConfigMap", true);
        let scope = ns.map(|n| NamespaceScope::only([n])).unwrap_or(NamespaceScope::All);
        CacheKey::new(Some(ctx), &kind, Some(&scope))
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_until_ttl_then_absent() {
        let cache = SnapshotCache::new();
        cache.put(key("c1", None), vec![1, 2, 3], Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(cache.get(&key("c1", None)), Some(vec![1, 2, 3]));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&key("c1", None)), None);
        // evicted by the read
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_scoped_by_context_and_namespace() {
        let cache = SnapshotCache::new();
        cache.put(key("c1", Some("dev")), vec!["a"], Duration::from_secs(5));
        assert_eq!(cache.get(&key("c1", Some("prod"))), None);
        assert_eq!(cache.get(&key("c2", Some("dev"))), None);
        assert_eq!(cache.get(&key("c1", None)), None);
        assert_eq!(cache.get(&key("c1", Some("dev"))), Some(vec!["a"]));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_purge() {
        let cache = SnapshotCache::new();
        cache.put(key("c1", None), vec![1], Duration::from_secs(5));
        cache.put(key("c1", Some("dev")), vec![2], Duration::from_millis(10));
        cache.put(key("c2", None), vec![3], Duration::from_secs(5));
        assert!(cache.invalidate(&key("c2", None)));
        assert!(!cache.invalidate(&key("c2", None)));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_context(Some("c1")), 1);
        assert!(cache.is_empty());
    }

    fn cm(ns: &str, name: &str, rv: &str) -> LiteObj {
        LiteObj {
            uid: [0u8; 16],
            namespace: Some(ns.to_string()),
            name: name.to_string(),
            resource_version: Some(rv.to_string()),
            creation_ts: 0,
            labels: Default::default(),
        }
    }

    fn names(items: Option<Vec<LiteObj>>) -> Option<Vec<String>> {
        items.map(|v| v.into_iter().map(|o| o.name).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn events_fold_into_matching_snapshots() {
        let cache = SnapshotCache::new();
        let ttl = Duration::from_secs(5);
        cache.put(key("c1", Some("dev")), vec![cm("dev", "a", "1"), cm("dev", "b", "1")], ttl);
        cache.put(key("c1", None), vec![cm("dev", "a", "1"), cm("dev", "b", "1"), cm("prod", "z", "1")], ttl);
        cache.put(key("c2", Some("dev")), vec![cm("dev", "a", "1")], ttl);

        assert_eq!(cache.merge_event(Some("c1"), "v1/ConfigMap", &ChangeEvent::Deleted(cm("dev", "a", "2"))), 2);
        assert_eq!(cache.merge_event(Some("c1"), "v1/ConfigMap", &ChangeEvent::Added(cm("prod", "y", "1"))), 1);
        assert_eq!(cache.merge_event(Some("c1"), "v1/ConfigMap", &ChangeEvent::Deleted(cm("dev", "ghost", "1"))), 0);
        assert_eq!(cache.merge_event(Some("c1"), "v1/Secret", &ChangeEvent::Deleted(cm("dev", "b", "2"))), 0);

        assert_eq!(names(cache.get(&key("c1", Some("dev")))), Some(vec!["b".to_string()]));
        assert_eq!(names(cache.get(&key("c1", None))), Some(vec!["b".into(), "z".into(), "y".into()]));
        assert_eq!(names(cache.get(&key("c2", Some("dev")))), Some(vec!["a".to_string()]));

        // Merging keeps the original expiry.
        tokio::time::advance(ttl).await;
        assert_eq!(cache.merge_event(Some("c1"), "v1/ConfigMap", &ChangeEvent::Added(cm("dev", "c", "1"))), 0);
        assert_eq!(cache.get(&key("c1", Some("dev"))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn readers_get_copies() {
        let cache = SnapshotCache::new();
        cache.put(key("c1", None), vec![1, 2], Duration::from_secs(5));
        let mut mine = cache.get(&key("c1", None)).unwrap();
        mine.push(99);
        assert_eq!(cache.get(&key("c1", None)), Some(vec![1, 2]));
    }
}
