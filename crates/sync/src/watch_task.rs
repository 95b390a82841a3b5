use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use kite_api::{Subscription, Transport};
use kite_core::{ChangeEvent, KiteError, NamespaceScope, ResourceKind, SyncConfig};
use kite_store::{CacheKey, SnapshotCache};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::state::{Shared, SyncPhase};

/// Optional observer run for every delivered event before it is merged.
pub type EventHook<T> = Arc<dyn Fn(&ChangeEvent<T>) -> anyhow::Result<()> + Send + Sync>;

/// Everything the background task needs, detached from the synchronizer's borrow.
pub(crate) struct WatchCtx<Tr: Transport> {
    pub(crate) transport: Arc<Tr>,
    pub(crate) cache: Arc<SnapshotCache<Tr::Item>>,
    pub(crate) shared: Arc<Shared<Tr::Item>>,
    pub(crate) kind: ResourceKind,
    pub(crate) scope: Option<NamespaceScope>,
    pub(crate) key: CacheKey,
    pub(crate) config: SyncConfig,
    pub(crate) hook: Option<EventHook<Tr::Item>>,
    pub(crate) generation: u64,
}

/// Run the per-event observer with failures and panics contained.
fn run_hook<T: 'static>(hook: &EventHook<T>, gvk: &str, event: &ChangeEvent<T>) {
    match catch_unwind(AssertUnwindSafe(|| hook(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            counter!("kite_sync_event_failures_total", 1);
            warn!(gvk = %gvk, event = event.label(), error = %e, "sync: event hook failed; continuing");
        }
        Err(_) => {
            counter!("kite_sync_event_failures_total", 1);
            warn!(gvk = %gvk, event = event.label(), "sync: event hook panicked; continuing");
        }
    }
}

impl<Tr: Transport> WatchCtx<Tr> {
    /// Merge events until the subscription ends, then reconnect if configured.
    /// `sub == None` means the initial subscribe failed and the task starts by reconnecting.
    pub(crate) async fn run(self, mut sub: Option<Subscription<Tr::Item>>) {
        let gvk = self.kind.gvk_key();
        let mut attempt: u32 = 0;
        loop {
            if let Some(mut s) = sub.take() {
                let channel = s.channel();
                let mut first = true;
                while let Some(item) = s.recv().await {
                    let event = match item {
                        Ok(ev) => ev,
                        Err(e) => {
                            counter!("kite_sync_event_failures_total", 1);
                            warn!(gvk = %gvk, channel = %channel, error = %e, "sync: dropping malformed event");
                            continue;
                        }
                    };
                    if first {
                        debug!(gvk = %gvk, channel = %channel, "sync: first event received");
                        first = false;
                    }
                    if !self.shared.is_current(self.generation) {
                        debug!(gvk = %gvk, channel = %channel, "sync: stale subscription; stopping");
                        return;
                    }
                    if let Some(hook) = &self.hook {
                        run_hook(hook, &gvk, &event);
                    }
                    let label = event.label();
                    let current = self.shared.update_if_current(self.generation, |st| {
                        self.cache.merge_event(self.key.context.as_deref(), &self.key.gvk, &event);
                        st.live.apply(event).changed()
                    });
                    if !current {
                        debug!(gvk = %gvk, channel = %channel, "sync: stale subscription; stopping");
                        return;
                    }
                    counter!("kite_sync_events_total", 1, "type" => label);
                }
                drop(s);
                let lost = KiteError::SubscriptionLost { channel: channel.to_string() };
                let reconnect = self.config.reconnect;
                let current = self.shared.update_if_current(self.generation, |st| {
                    st.error = Some(lost.clone());
                    st.cancel = None;
                    st.channel = None;
                    st.phase = if reconnect { SyncPhase::Reconnecting } else { SyncPhase::Lost };
                    true
                });
                if !current {
                    return;
                }
                warn!(gvk = %gvk, channel = %channel, reconnect, "sync: subscription lost");
                if !reconnect {
                    return;
                }
            }

            let delay = self.config.backoff_for(attempt);
            attempt = attempt.saturating_add(1);
            debug!(gvk = %gvk, attempt, delay_ms = %delay.as_millis(), "sync: reconnect scheduled");
            tokio::time::sleep(delay).await;
            match self.resync().await {
                Ok(Some(next)) => {
                    counter!("kite_sync_reconnects_total", 1);
                    info!(gvk = %gvk, attempt, channel = %next.channel(), "sync: reconnected");
                    attempt = 0;
                    sub = Some(next);
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(gvk = %gvk, attempt, error = %e, "sync: reconnect failed");
                    if !self.shared.update_if_current(self.generation, |st| { st.error = Some(e); true }) {
                        return;
                    }
                }
            }
        }
    }

    /// Relist (bypassing the cache) and resubscribe. `Ok(None)` when this task went stale.
    async fn resync(&self) -> Result<Option<Subscription<Tr::Item>>, KiteError> {
        self.cache.invalidate(&self.key);
        let t0 = Instant::now();
        let items = self.transport.list(&self.kind, self.scope.as_ref()).await?;
        histogram!("kite_sync_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        self.cache.put(self.key.clone(), items.clone(), self.config.cache_ttl);
        let scope = self.scope.clone();
        if !self.shared.update_if_current(self.generation, |st| { st.live.reset(items, scope); true }) {
            return Ok(None);
        }
        let sub = self.transport.watch(&self.kind, self.scope.as_ref()).await?;
        let (channel, cancel) = (sub.channel(), sub.cancel_handle());
        let installed = self.shared.update_if_current(self.generation, |st| {
            st.channel = Some(channel);
            st.cancel = Some(cancel);
            st.error = None;
            st.phase = SyncPhase::Watching;
            true
        });
        Ok(installed.then_some(sub))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use kite_api::MockTransport;
    use kite_core::LiteObj;

    use super::*;

    fn pod(name: &str) -> LiteObj {
        LiteObj {
            uid: [1u8; 16],
            namespace: Some("default".into()),
            name: name.into(),
            resource_version: Some("1".into()),
            creation_ts: 0,
            labels: Default::default(),
        }
    }

    fn ctx(mock: &Arc<MockTransport>, generation: u64, hook: EventHook<LiteObj>) -> WatchCtx<MockTransport> {
        let kind = ResourceKind::new("", "v1", "Pod", true);
        let scope = Some(NamespaceScope::All);
        WatchCtx {
            transport: Arc::clone(mock),
            cache: Arc::new(SnapshotCache::new()),
            shared: Arc::new(Shared::new()),
            key: CacheKey::new(None, &kind, scope.as_ref()),
            kind,
            scope,
            config: SyncConfig { reconnect: false, ..SyncConfig::default() },
            hook: Some(hook),
            generation,
        }
    }

    fn counting_hook() -> (Arc<AtomicUsize>, EventHook<LiteObj>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let hook: EventHook<LiteObj> = Arc::new(move |_ev: &ChangeEvent<LiteObj>| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (calls, hook)
    }

    #[tokio::test]
    async fn stale_generation_never_reaches_hook() {
        let mock = Arc::new(MockTransport::new());
        let (calls, hook) = counting_hook();
        // Fresh state sits at generation 0, so a task tagged 1 is already stale.
        let task = ctx(&mock, 1, hook);
        let shared = Arc::clone(&task.shared);
        let sub = mock.watch(&task.kind, None).await.unwrap();
        mock.emit(ChangeEvent::Added(pod("late")));

        tokio::time::timeout(Duration::from_secs(5), task.run(Some(sub))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(shared.view().items.is_empty());
    }

    #[tokio::test]
    async fn current_events_update_list_and_cached_snapshot() {
        let mock = Arc::new(MockTransport::new());
        let (calls, hook) = counting_hook();
        let task = ctx(&mock, 0, hook);
        let (shared, cache, key) = (Arc::clone(&task.shared), Arc::clone(&task.cache), task.key.clone());
        cache.put(key.clone(), vec![pod("gone")], Duration::from_secs(5));
        shared.update_if_current(0, |st| {
            st.live.reset(vec![pod("gone")], Some(NamespaceScope::All));
            true
        });

        let sub = mock.watch(&task.kind, None).await.unwrap();
        mock.emit(ChangeEvent::Deleted(pod("gone")));
        mock.emit(ChangeEvent::Added(pod("new")));
        mock.drop_subscriptions();

        tokio::time::timeout(Duration::from_secs(5), task.run(Some(sub))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let view = shared.view();
        assert_eq!(view.phase, SyncPhase::Lost);
        assert_eq!(view.items.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), ["new"]);
        let cached = cache.get(&key).unwrap();
        assert_eq!(cached.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), ["new"]);
    }
}
