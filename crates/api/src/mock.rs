use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kite_core::config::DEFAULT_QUEUE_CAP;
use kite_core::{ChangeEvent, KiteError, KiteResult, LiteObj, NamespaceScope, Resource, ResourceKey, ResourceKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CancelHandle, ChannelId, Subscription, Transport, WatchItem};

/// Simple in-memory transport for tests.
///
/// Holds one server-side collection per kind. Change events are not generated
/// automatically: tests push them with [`MockTransport::emit`] so they control
/// exactly when a notification arrives relative to local writes.
pub struct MockTransport {
    state: Mutex<MockState>,
    queue_cap: usize,
}

#[derive(Default)]
struct MockState {
    items: HashMap<String, Vec<LiteObj>>,
    subs: Vec<MockSub>,
    fail_list: Option<KiteError>,
    fail_watch: Option<KiteError>,
    fail_create: Option<KiteError>,
    list_calls: usize,
    watch_calls: usize,
}

struct MockSub {
    channel: ChannelId,
    tx: mpsc::Sender<WatchItem<LiteObj>>,
    cancel: CancelHandle,
}

impl MockSub {
    fn attached(&self) -> bool { !self.tx.is_closed() && !self.cancel.is_cancelled() }
}

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

impl MockTransport {
    pub fn new() -> Self { Self::with_capacity(DEFAULT_QUEUE_CAP) }

    /// Mock whose subscriptions buffer at most `queue_cap` undelivered events,
    /// as `KubeTransport` does with `SyncConfig::queue_cap`.
    pub fn with_capacity(queue_cap: usize) -> Self {
        Self { state: Mutex::new(MockState::default()), queue_cap: queue_cap.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Replace the server-side collection for `kind`.
    pub fn seed(&self, kind: &ResourceKind, items: Vec<LiteObj>) {
        self.lock().items.insert(kind.gvk_key(), items);
    }

    pub fn set_list_error(&self, err: Option<KiteError>) { self.lock().fail_list = err; }
    pub fn set_watch_error(&self, err: Option<KiteError>) { self.lock().fail_watch = err; }
    pub fn set_create_error(&self, err: Option<KiteError>) { self.lock().fail_create = err; }

    pub fn list_calls(&self) -> usize { self.lock().list_calls }
    pub fn watch_calls(&self) -> usize { self.lock().watch_calls }

    /// Subscriptions whose consumer is still attached.
    pub fn live_subscriptions(&self) -> usize {
        let mut st = self.lock();
        st.subs.retain(MockSub::attached);
        st.subs.len()
    }

    /// Deliver an event to every attached subscription. Returns how many received it.
    pub fn emit(&self, event: ChangeEvent<LiteObj>) -> usize {
        self.send_all(Ok(event))
    }

    /// Deliver a per-event failure, as a transport would for an unshapeable object.
    pub fn emit_error(&self, err: KiteError) -> usize {
        self.send_all(Err(err))
    }

    fn send_all(&self, item: WatchItem<LiteObj>) -> usize {
        let mut st = self.lock();
        st.subs.retain(MockSub::attached);
        let mut delivered = 0;
        for s in st.subs.iter() {
            match s.tx.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(channel = %s.channel, error = %e, "mock: event not delivered"),
            }
        }
        delivered
    }

    /// Close every subscription from the server side, as after a backend restart.
    pub fn drop_subscriptions(&self) -> usize {
        let mut st = self.lock();
        let n = st.subs.len();
        st.subs.clear();
        n
    }
}

fn object_from_manifest(mut manifest: serde_json::Value, namespace: Option<&str>) -> KiteResult<LiteObj> {
    let meta = manifest
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| KiteError::Malformed("manifest missing metadata".into()))?;
    if let Some(ns) = namespace {
        meta.insert("namespace".into(), serde_json::Value::String(ns.to_string()));
    }
    meta.entry("uid").or_insert_with(|| serde_json::Value::String(uuid::Uuid::new_v4().to_string()));
    meta.entry("resourceVersion").or_insert_with(|| serde_json::Value::String("1".into()));
    LiteObj::from_raw(&manifest)
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    type Item = LiteObj;

    async fn list(&self, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> KiteResult<Vec<LiteObj>> {
        let mut st = self.lock();
        st.list_calls += 1;
        if let Some(e) = st.fail_list.clone() {
            return Err(e);
        }
        let items = st.items.get(&kind.gvk_key()).cloned().unwrap_or_default();
        Ok(items.into_iter().filter(|o| scope.map(|s| s.admits(o.namespace())).unwrap_or(true)).collect())
    }

    async fn watch(&self, _kind: &ResourceKind, _scope: Option<&NamespaceScope>) -> KiteResult<Subscription<LiteObj>> {
        let mut st = self.lock();
        st.watch_calls += 1;
        if let Some(e) = st.fail_watch.clone() {
            return Err(e);
        }
        let channel = ChannelId::generate();
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let cancel = CancelHandle::new(None);
        st.subs.push(MockSub { channel, tx, cancel: cancel.clone() });
        Ok(Subscription::new(channel, rx, cancel))
    }

    async fn create(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<LiteObj> {
        let mut st = self.lock();
        if let Some(e) = st.fail_create.clone() {
            return Err(e);
        }
        let obj = object_from_manifest(manifest, namespace)?;
        let items = st.items.entry(kind.gvk_key()).or_default();
        if items.iter().any(|o| o.has_key(&obj.key())) {
            return Err(KiteError::Transport(format!("{} already exists", obj.key())));
        }
        items.push(obj.clone());
        Ok(obj)
    }

    async fn update(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<LiteObj> {
        let mut st = self.lock();
        let obj = object_from_manifest(manifest, namespace)?;
        let items = st.items.entry(kind.gvk_key()).or_default();
        let slot = items
            .iter_mut()
            .find(|o| o.has_key(&obj.key()))
            .ok_or_else(|| KiteError::Transport(format!("{} not found", obj.key())))?;
        *slot = obj.clone();
        Ok(obj)
    }

    async fn delete(&self, kind: &ResourceKind, keys: &[ResourceKey]) -> Vec<KiteResult<()>> {
        let mut st = self.lock();
        let items = st.items.entry(kind.gvk_key()).or_default();
        keys.iter()
            .map(|k| match items.iter().position(|o| o.has_key(k)) {
                Some(idx) => {
                    items.remove(idx);
                    Ok(())
                }
                None => Err(KiteError::Transport(format!("{} not found", k))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceKind { ResourceKind::new("", "v1", "Pod", true) }

    fn manifest(name: &str) -> serde_json::Value {
        serde_json::json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": name } })
    }

    #[tokio::test]
    async fn create_then_batch_delete_reports_per_key() {
        let mock = MockTransport::new();
        let created = mock.create(&pods(), Some("default"), manifest("web")).await.unwrap();
        assert_eq!(created.key(), ResourceKey::namespaced("default", "web"));
        let res = mock
            .delete(&pods(), &[ResourceKey::namespaced("default", "web"), ResourceKey::namespaced("default", "ghost")])
            .await;
        assert!(res[0].is_ok());
        assert!(matches!(res[1], Err(KiteError::Transport(_))));
    }

    #[tokio::test]
    async fn list_filters_by_scope() {
        let mock = MockTransport::new();
        mock.create(&pods(), Some("a"), manifest("x")).await.unwrap();
        mock.create(&pods(), Some("b"), manifest("y")).await.unwrap();
        let only_a = mock.list(&pods(), Some(&NamespaceScope::only(["a"]))).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(mock.list(&pods(), Some(&NamespaceScope::All)).await.unwrap().len(), 2);
        assert_eq!(mock.list_calls(), 2);
    }

    #[tokio::test]
    async fn emit_reaches_attached_subscriptions_only() {
        let mock = MockTransport::new();
        let mut a = mock.watch(&pods(), None).await.unwrap();
        let b = mock.watch(&pods(), None).await.unwrap();
        drop(b);
        assert_eq!(mock.live_subscriptions(), 1);
        let obj = mock.create(&pods(), Some("default"), manifest("p")).await.unwrap();
        assert_eq!(mock.emit(ChangeEvent::Added(obj.clone())), 1);
        assert_eq!(a.recv().await, Some(Ok(ChangeEvent::Added(obj))));
        mock.drop_subscriptions();
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn bounded_queue_drops_overflow() {
        let mock = MockTransport::with_capacity(1);
        let mut sub = mock.watch(&pods(), None).await.unwrap();
        let a = mock.create(&pods(), Some("default"), manifest("a")).await.unwrap();
        let b = mock.create(&pods(), Some("default"), manifest("b")).await.unwrap();
        assert_eq!(mock.emit(ChangeEvent::Added(a.clone())), 1);
        assert_eq!(mock.emit(ChangeEvent::Added(b.clone())), 0);
        assert_eq!(sub.recv().await, Some(Ok(ChangeEvent::Added(a))));
        assert_eq!(mock.emit(ChangeEvent::Added(b.clone())), 1);
        assert_eq!(sub.recv().await, Some(Ok(ChangeEvent::Added(b))));
    }

    #[tokio::test]
    async fn cancelled_handle_counts_as_detached() {
        let mock = MockTransport::new();
        let sub = mock.watch(&pods(), None).await.unwrap();
        assert_eq!(mock.live_subscriptions(), 1);
        sub.cancel_handle().cancel();
        assert_eq!(mock.live_subscriptions(), 0);
        drop(sub);
    }
}
