use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use kite_api::{CancelHandle, ChannelId};
use kite_core::{KiteError, NamespaceScope, Resource};
use kite_store::LiveList;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    /// Initial list in flight.
    Listing,
    /// Subscription attached; events are being merged.
    Watching,
    /// Subscription lost; relisting and resubscribing with backoff.
    Reconnecting,
    /// List failed; retry with `refresh` or a new scope.
    Failed,
    /// Subscription lost and reconnect is disabled. Data may be stale.
    Lost,
    Detached,
}

/// Immutable view published after every change. Readers never see a partially merged slice.
#[derive(Debug, Clone)]
pub struct SyncView<T> {
    pub phase: SyncPhase,
    pub items: Arc<Vec<T>>,
    pub scope: Option<NamespaceScope>,
    pub error: Option<KiteError>,
    /// Increments on every publish.
    pub epoch: u64,
    pub channel: Option<ChannelId>,
}

impl<T> SyncView<T> {
    fn initial() -> Self {
        Self { phase: SyncPhase::Idle, items: Arc::new(Vec::new()), scope: None, error: None, epoch: 0, channel: None }
    }

    pub fn is_loading(&self) -> bool { self.phase == SyncPhase::Listing }
    pub fn is_live(&self) -> bool { self.phase == SyncPhase::Watching }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Mutable state owned by one synchronizer and its background task.
pub(crate) struct ListState<T> {
    pub(crate) live: LiveList<T>,
    pub(crate) phase: SyncPhase,
    pub(crate) error: Option<KiteError>,
    pub(crate) channel: Option<ChannelId>,
    /// Detach capability of the subscription currently feeding `live`.
    pub(crate) cancel: Option<CancelHandle>,
    /// Bumped on every start and detach; background work tagged with an older
    /// generation must not touch the list.
    pub(crate) generation: u64,
    pub(crate) detached: bool,
    epoch: u64,
}

pub(crate) struct Shared<T> {
    state: Mutex<ListState<T>>,
    view: ArcSwap<SyncView<T>>,
    epoch_tx: watch::Sender<u64>,
}

impl<T: Resource> Shared<T> {
    pub(crate) fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        let state = ListState {
            live: LiveList::new(),
            phase: SyncPhase::Idle,
            error: None,
            channel: None,
            cancel: None,
            generation: 0,
            detached: false,
            epoch: 0,
        };
        Self { state: Mutex::new(state), view: ArcSwap::from_pointee(SyncView::initial()), epoch_tx }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ListState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Freeze `st` into a new view. Call with the state lock held so views publish in order.
    pub(crate) fn publish(&self, st: &mut ListState<T>) {
        st.epoch = st.epoch.saturating_add(1);
        let view = SyncView {
            phase: st.phase,
            items: st.live.freeze(),
            scope: st.live.scope().cloned(),
            error: st.error.clone(),
            epoch: st.epoch,
            channel: st.channel,
        };
        self.view.store(Arc::new(view));
        self.epoch_tx.send_replace(st.epoch);
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let st = self.lock();
        !st.detached && st.generation == generation
    }

    /// Run `f` only while `generation` is still current; publish when it returns true.
    /// Returns false when the caller's generation is stale.
    pub(crate) fn update_if_current(&self, generation: u64, f: impl FnOnce(&mut ListState<T>) -> bool) -> bool {
        let mut st = self.lock();
        if st.detached || st.generation != generation {
            return false;
        }
        if f(&mut st) {
            self.publish(&mut st);
        }
        true
    }

    pub(crate) fn view(&self) -> Arc<SyncView<T>> { self.view.load_full() }

    pub(crate) fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}
