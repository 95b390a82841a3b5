use kite_core::{ChangeEvent, Resource, ResourceKey};
use rustc_hash::FxHashMap;

/// Last seen object per key on one watch stream.
///
/// Turns the watcher's applied/deleted/relist vocabulary into Added/Modified/Deleted
/// events and drops re-deliveries of an unchanged resourceVersion.
pub struct KeyTracker<T> {
    seen: FxHashMap<ResourceKey, T>,
}

impl<T: Resource> Default for KeyTracker<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Resource> KeyTracker<T> {
    pub fn new() -> Self { Self { seen: FxHashMap::default() } }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }

    /// `None` when the object was already seen at the same version.
    pub fn applied(&mut self, obj: T) -> Option<ChangeEvent<T>> {
        let key = obj.key();
        match self.seen.get(&key) {
            Some(prev) if prev.version().is_some() && prev.version() == obj.version() => None,
            Some(_) => {
                self.seen.insert(key, obj.clone());
                Some(ChangeEvent::Modified(obj))
            }
            None => {
                self.seen.insert(key, obj.clone());
                Some(ChangeEvent::Added(obj))
            }
        }
    }

    /// Prefers the last seen copy so the event carries full state.
    pub fn deleted(&mut self, obj: T) -> ChangeEvent<T> {
        match self.seen.remove(&obj.key()) {
            Some(prev) => ChangeEvent::Deleted(prev),
            None => ChangeEvent::Deleted(obj),
        }
    }

    /// Diff a full relist against what was seen before: upserts for present objects,
    /// deletes for keys that vanished while the watch was down.
    pub fn restarted(&mut self, list: Vec<T>) -> Vec<ChangeEvent<T>> {
        let mut previous = std::mem::take(&mut self.seen);
        let mut out = Vec::with_capacity(list.len());
        for obj in list {
            let key = obj.key();
            match previous.remove(&key) {
                Some(prev) => {
                    let unchanged = prev.version().is_some() && prev.version() == obj.version();
                    self.seen.insert(key, obj.clone());
                    if !unchanged {
                        out.push(ChangeEvent::Modified(obj));
                    }
                }
                None => {
                    self.seen.insert(key, obj.clone());
                    out.push(ChangeEvent::Added(obj));
                }
            }
        }
        let mut gone: Vec<(ResourceKey, T)> = previous.into_iter().collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(gone.into_iter().map(|(_, o)| ChangeEvent::Deleted(o)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::LiteObj;

    fn obj(name: &str, rv: &str) -> LiteObj {
        LiteObj {
            uid: [0u8; 16],
            namespace: Some("default".into()),
            name: name.into(),
            resource_version: Some(rv.into()),
            creation_ts: 0,
            labels: Default::default(),
        }
    }

    fn labels(events: &[ChangeEvent<LiteObj>]) -> Vec<(String, &'static str)> {
        events.iter().map(|e| (e.object().name.clone(), e.label())).collect()
    }

    #[test]
    fn first_apply_is_added_then_modified() {
        let mut t = KeyTracker::new();
        assert!(matches!(t.applied(obj("a", "1")), Some(ChangeEvent::Added(_))));
        assert!(t.applied(obj("a", "1")).is_none());
        assert!(matches!(t.applied(obj("a", "2")), Some(ChangeEvent::Modified(_))));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn delete_carries_last_seen_state() {
        let mut t = KeyTracker::new();
        t.applied(obj("a", "5"));
        let ev = t.deleted(obj("a", ""));
        assert_eq!(ev.object().resource_version.as_deref(), Some("5"));
        assert!(t.is_empty());
    }

    #[test]
    fn relist_diffs_against_previous() {
        let mut t = KeyTracker::new();
        t.applied(obj("keep", "1"));
        t.applied(obj("change", "1"));
        t.applied(obj("gone", "1"));
        let out = t.restarted(vec![obj("keep", "1"), obj("change", "2"), obj("new", "1")]);
        assert_eq!(
            labels(&out),
            [("change".to_string(), "modified"), ("new".to_string(), "added"), ("gone".to_string(), "deleted")]
        );
        assert_eq!(t.len(), 3);
    }
}
