//! Kite list+watch synchronizer.
//!
//! A [`Synchronizer`] keeps one displayed list of entities of a single kind
//! consistent with the cluster: it lists once (or serves a fresh cached
//! snapshot), then merges change notifications from a [`Transport`]
//! subscription into the list. Readers take immutable [`SyncView`]s that are
//! republished after every change.
//!
//! Changing the namespace scope detaches the current subscription before a
//! new one is requested, so a consumer never has two live subscriptions for
//! the same kind.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kite_api::Transport;
use kite_core::{
    sort_items, ChangeEvent, FieldAccessors, KiteError, KiteResult, NamespaceScope, Resource, ResourceKey, ResourceKind,
    ScopeError, ScopeQuery, SortDirection, SyncConfig,
};
use kite_store::{CacheKey, SnapshotCache};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod overlay;
mod state;
mod watch_task;

pub use overlay::OptimisticOverlay;
pub use state::{SyncPhase, SyncView};
pub use watch_task::EventHook;

use state::Shared;
use watch_task::WatchCtx;

/// Keeps the list for one (context, kind) in step with the cluster.
pub struct Synchronizer<Tr: Transport> {
    transport: Arc<Tr>,
    cache: Arc<SnapshotCache<Tr::Item>>,
    kind: ResourceKind,
    context: Option<String>,
    config: SyncConfig,
    shared: Arc<Shared<Tr::Item>>,
    task: Option<JoinHandle<()>>,
    /// Scope of the last `start`, reused by `refresh`.
    scope: Option<NamespaceScope>,
    query: ScopeQuery,
    hook: Option<EventHook<Tr::Item>>,
}

impl<Tr: Transport> Synchronizer<Tr> {
    pub fn new(
        transport: Arc<Tr>,
        cache: Arc<SnapshotCache<Tr::Item>>,
        kind: ResourceKind,
        context: Option<&str>,
        config: SyncConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            kind,
            context: context.map(|s| s.to_string()),
            config,
            shared: Arc::new(Shared::new()),
            task: None,
            scope: None,
            query: ScopeQuery::all(),
            hook: None,
        }
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }
    pub fn context(&self) -> Option<&str> { self.context.as_deref() }

    /// Latest published view. Cheap; never blocks on event delivery.
    pub fn view(&self) -> Arc<SyncView<Tr::Item>> { self.shared.view() }

    /// Receiver that observes the epoch of every published view.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.subscribe_epoch() }

    /// Current items ordered by `key`. The published view keeps delivery order.
    pub fn sorted(&self, key: &str, direction: SortDirection, accessors: &FieldAccessors<Tr::Item>) -> Vec<Tr::Item> {
        sort_items(&self.view().items, key, direction, accessors)
    }

    pub fn overlay(&self) -> OptimisticOverlay<Tr::Item> { OptimisticOverlay::new(Arc::clone(&self.shared)) }

    /// Observe every delivered event before it is merged. Errors and panics are
    /// logged and counted; the event is still applied. Takes effect from the
    /// next `start`, `change_scope` or `refresh`.
    pub fn set_event_hook(&mut self, hook: impl Fn(&ChangeEvent<Tr::Item>) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.hook = Some(Arc::new(hook));
    }

    pub fn is_detached(&self) -> bool { self.shared.lock().detached }

    fn cache_key(&self, scope: Option<&NamespaceScope>) -> CacheKey { CacheKey::new(self.context.as_deref(), &self.kind, scope) }

    /// Cluster-scoped kinds ignore any scope; namespaced kinds require one.
    fn normalize(&self, scope: Option<NamespaceScope>) -> KiteResult<Option<NamespaceScope>> {
        if !self.kind.namespaced {
            return Ok(None);
        }
        match scope {
            Some(s) => Ok(Some(s)),
            None => Err(ScopeError::Unscoped(self.kind.gvk_key()).into()),
        }
    }

    /// Detach whatever is feeding the list and clear it for `scope`.
    /// Returns the generation the next subscription must carry.
    fn detach_current(&mut self, scope: Option<NamespaceScope>) -> u64 {
        let generation = {
            let mut st = self.shared.lock();
            st.generation = st.generation.wrapping_add(1);
            if let Some(cancel) = st.cancel.take() {
                cancel.cancel();
            }
            st.channel = None;
            st.error = None;
            st.phase = SyncPhase::Listing;
            st.live.reset(Vec::new(), scope);
            self.shared.publish(&mut st);
            st.generation
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        generation
    }

    /// Load the list for `scope` and attach a subscription.
    ///
    /// Suspends until the list is available. A fresh cached snapshot is served
    /// without a list call. On list failure the view moves to
    /// [`SyncPhase::Failed`] and no subscription is requested.
    pub async fn start(&mut self, scope: Option<NamespaceScope>) -> KiteResult<()> {
        if self.is_detached() {
            return Err(KiteError::Detached);
        }
        let scope = self.normalize(scope)?;
        let gvk = self.kind.gvk_key();
        let scope_label = scope.as_ref().map(|s| s.label()).unwrap_or_else(|| "cluster".into());
        let generation = self.detach_current(scope.clone());
        self.scope = scope.clone();

        let key = self.cache_key(scope.as_ref());
        let items = match self.cache.get(&key) {
            Some(items) => {
                debug!(gvk = %gvk, ns = %scope_label, count = items.len(), "sync: serving cached snapshot");
                items
            }
            None => {
                let t0 = Instant::now();
                match self.transport.list(&self.kind, scope.as_ref()).await {
                    Ok(items) => {
                        let took_ms = t0.elapsed().as_millis();
                        histogram!("kite_sync_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        info!(gvk = %gvk, ns = %scope_label, count = items.len(), took_ms = %took_ms, "sync: list ok");
                        self.cache.put(key, items.clone(), self.config.cache_ttl);
                        items
                    }
                    Err(e) => {
                        warn!(gvk = %gvk, ns = %scope_label, error = %e, "sync: list failed");
                        self.shared.update_if_current(generation, |st| {
                            st.phase = SyncPhase::Failed;
                            st.error = Some(e.clone());
                            true
                        });
                        return Err(e);
                    }
                }
            }
        };
        let snapshot_scope = scope.clone();
        if !self.shared.update_if_current(generation, |st| {
            st.live.reset(items, snapshot_scope);
            true
        }) {
            return Err(KiteError::Detached);
        }

        let ctx = WatchCtx {
            transport: Arc::clone(&self.transport),
            cache: Arc::clone(&self.cache),
            shared: Arc::clone(&self.shared),
            kind: self.kind.clone(),
            scope: scope.clone(),
            key: self.cache_key(scope.as_ref()),
            config: self.config.clone(),
            hook: self.hook.clone(),
            generation,
        };
        match self.transport.watch(&self.kind, scope.as_ref()).await {
            Ok(sub) => {
                let (channel, cancel) = (sub.channel(), sub.cancel_handle());
                let installed = self.shared.update_if_current(generation, |st| {
                    st.channel = Some(channel);
                    st.cancel = Some(cancel);
                    st.phase = SyncPhase::Watching;
                    true
                });
                if !installed {
                    return Err(KiteError::Detached);
                }
                info!(gvk = %gvk, ns = %scope_label, channel = %channel, "sync: watching");
                self.task = Some(tokio::spawn(ctx.run(Some(sub))));
                Ok(())
            }
            Err(e) => {
                let reconnect = self.config.reconnect;
                warn!(gvk = %gvk, ns = %scope_label, error = %e, reconnect, "sync: subscribe failed");
                self.shared.update_if_current(generation, |st| {
                    st.phase = if reconnect { SyncPhase::Reconnecting } else { SyncPhase::Lost };
                    st.error = Some(e.clone());
                    true
                });
                if reconnect {
                    self.task = Some(tokio::spawn(ctx.run(None)));
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Switch to `scope`. No-op when that scope is already being watched.
    pub async fn change_scope(&mut self, scope: Option<NamespaceScope>) -> KiteResult<()> {
        if self.is_detached() {
            return Err(KiteError::Detached);
        }
        let scope = self.normalize(scope)?;
        let view = self.view();
        if view.scope == scope && matches!(view.phase, SyncPhase::Watching | SyncPhase::Reconnecting) {
            debug!(gvk = %self.kind.gvk_key(), "sync: scope unchanged");
            return Ok(());
        }
        info!(gvk = %self.kind.gvk_key(), ns = %scope.as_ref().map(|s| s.label()).unwrap_or_default(), "sync: scope changed");
        self.start(scope).await
    }

    /// Adopt a resolved namespace selection: its scope drives the list and its
    /// default namespace becomes the write target for `create`/`update`.
    pub async fn set_query(&mut self, query: ScopeQuery) -> KiteResult<()> {
        let scope = query.scope_for(&self.kind)?;
        self.query = query;
        self.change_scope(scope).await
    }

    pub fn query(&self) -> &ScopeQuery { &self.query }

    /// Drop the cached snapshot and relist the current scope.
    pub async fn refresh(&mut self) -> KiteResult<()> {
        if self.is_detached() {
            return Err(KiteError::Detached);
        }
        let scope = self.scope.clone();
        self.cache.invalidate(&self.cache_key(scope.as_ref()));
        self.start(scope).await
    }

    /// Stop delivery and freeze the view. Later calls are no-ops.
    pub fn detach(&mut self) {
        let channel = {
            let mut st = self.shared.lock();
            if st.detached {
                return;
            }
            st.generation = st.generation.wrapping_add(1);
            st.detached = true;
            if let Some(cancel) = st.cancel.take() {
                cancel.cancel();
            }
            st.phase = SyncPhase::Detached;
            let channel = st.channel.take();
            self.shared.publish(&mut st);
            channel
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        match channel {
            Some(ch) => info!(gvk = %self.kind.gvk_key(), channel = %ch, "sync: detached"),
            None => debug!(gvk = %self.kind.gvk_key(), "sync: detached (no subscription)"),
        }
    }

    /// Create an entity and splice it into the list once the transport confirms.
    ///
    /// The namespace comes from `namespace`, then the manifest's
    /// `metadata.namespace`, then the query's default write namespace.
    pub async fn create(&self, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<Tr::Item> {
        if self.is_detached() {
            return Err(KiteError::Detached);
        }
        let ns = self.write_target(namespace, &manifest)?;
        let created = match self.transport.create(&self.kind, ns.as_deref(), manifest).await {
            Ok(obj) => obj,
            Err(e) => {
                counter!("kite_sync_write_failures_total", 1, "op" => "create");
                warn!(gvk = %self.kind.gvk_key(), ns = ?ns, error = %e, "sync: create failed");
                return Err(e);
            }
        };
        self.invalidate_current();
        let inserted = self.overlay().on_local_create(created.clone());
        info!(gvk = %self.kind.gvk_key(), key = %created.key(), inserted, "sync: created");
        Ok(created)
    }

    /// Update an entity and replace the listed copy once the transport confirms.
    pub async fn update(&self, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<Tr::Item> {
        if self.is_detached() {
            return Err(KiteError::Detached);
        }
        let ns = self.write_target(namespace, &manifest)?;
        let updated = match self.transport.update(&self.kind, ns.as_deref(), manifest).await {
            Ok(obj) => obj,
            Err(e) => {
                counter!("kite_sync_write_failures_total", 1, "op" => "update");
                warn!(gvk = %self.kind.gvk_key(), ns = ?ns, error = %e, "sync: update failed");
                return Err(e);
            }
        };
        self.invalidate_current();
        let replaced = self.overlay().on_local_update(updated.clone());
        info!(gvk = %self.kind.gvk_key(), key = %updated.key(), replaced, "sync: updated");
        Ok(updated)
    }

    /// Delete `keys`, one result per key in input order. The list itself
    /// changes when the Deleted notifications arrive.
    pub async fn delete(&self, keys: &[ResourceKey]) -> Vec<KiteResult<()>> {
        if self.is_detached() {
            return keys.iter().map(|_| Err(KiteError::Detached)).collect();
        }
        let results = self.transport.delete(&self.kind, keys).await;
        let mut failed = 0usize;
        for (key, res) in keys.iter().zip(results.iter()) {
            if let Err(e) = res {
                failed += 1;
                warn!(gvk = %self.kind.gvk_key(), key = %key, error = %e, "sync: delete failed");
            }
        }
        if failed > 0 {
            counter!("kite_sync_write_failures_total", failed as u64, "op" => "delete");
        }
        if failed < keys.len() {
            self.invalidate_current();
        }
        info!(gvk = %self.kind.gvk_key(), requested = keys.len(), failed, "sync: delete done");
        results
    }

    fn write_target(&self, explicit: Option<&str>, manifest: &serde_json::Value) -> KiteResult<Option<String>> {
        let from_manifest = manifest.pointer("/metadata/namespace").and_then(|v| v.as_str());
        Ok(self.query.write_namespace(&self.kind, explicit.or(from_manifest))?)
    }

    /// A local write makes the cached snapshot for the current scope stale.
    fn invalidate_current(&self) { self.cache.invalidate(&self.cache_key(self.scope.as_ref())); }
}

impl<Tr: Transport> Drop for Synchronizer<Tr> {
    fn drop(&mut self) { self.detach(); }
}
