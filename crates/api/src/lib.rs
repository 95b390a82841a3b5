//! Kite transport façade.
//!
//! This crate defines the boundary the synchronizer talks to: list, watch and
//! write operations for one cluster context, plus the typed [`Subscription`]
//! a watch hands back. Two implementations live here: [`KubeTransport`] for a
//! real cluster and [`MockTransport`] for tests and demos.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use kite_core::{ChangeEvent, KiteResult, NamespaceScope, Resource, ResourceKey, ResourceKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

mod kube_transport;
mod mock;

pub use kube_transport::KubeTransport;
pub use mock::MockTransport;

/// Identifier of one change-notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(uuid::Uuid);

impl ChannelId {
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4()) }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "watch-{}", self.0.simple()) }
}

/// Detach capability for a subscription. Cloneable, idempotent and callable
/// from any thread, including while an event is being delivered.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CancelHandle {
    /// Handle that aborts `task` (the producer side of the channel) on cancel.
    pub fn new(task: Option<JoinHandle<()>>) -> Self {
        Self { inner: Arc::new(CancelInner { cancelled: AtomicBool::new(false), task: Mutex::new(task) }) }
    }

    /// Returns true only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        // Aborting a task that already finished is a no-op
        if let Some(h) = task {
            h.abort();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::SeqCst) }
}

/// Item delivered on a subscription channel; `Err` marks one event that could not be shaped.
pub type WatchItem<T> = KiteResult<ChangeEvent<T>>;

/// A live change-notification subscription. Dropping it detaches.
pub struct Subscription<T> {
    channel: ChannelId,
    rx: mpsc::Receiver<WatchItem<T>>,
    cancel: CancelHandle,
}

impl<T> Subscription<T> {
    pub fn new(channel: ChannelId, rx: mpsc::Receiver<WatchItem<T>>, cancel: CancelHandle) -> Self {
        Self { channel, rx, cancel }
    }

    pub fn channel(&self) -> ChannelId { self.channel }

    /// Next item; `None` once the producer is gone (or after detach).
    pub async fn recv(&mut self) -> Option<WatchItem<T>> { self.rx.recv().await }

    pub fn cancel_handle(&self) -> CancelHandle { self.cancel.clone() }

    pub fn detach(&mut self) {
        if self.cancel.cancel() {
            debug!(channel = %self.channel, "api: subscription detached");
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) { self.detach(); }
}

/// Remote operations for one cluster context.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Item: Resource;

    /// Point-in-time list of `kind` within `scope` (`None` for cluster-scoped kinds).
    async fn list(&self, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> KiteResult<Vec<Self::Item>>;

    /// Open a change-notification subscription for `kind` within `scope`.
    async fn watch(&self, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> KiteResult<Subscription<Self::Item>>;

    async fn create(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<Self::Item>;

    async fn update(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<Self::Item>;

    /// One result per key, in request order.
    async fn delete(&self, kind: &ResourceKind, keys: &[ResourceKey]) -> Vec<KiteResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::LiteObj;

    #[tokio::test]
    async fn cancel_is_idempotent_and_aborts_producer() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let h = CancelHandle::new(Some(task));
        let h2 = h.clone();
        assert!(h.cancel());
        assert!(!h2.cancel());
        assert!(h2.is_cancelled());
        // the aborted producer drops its sender
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn drop_detaches_subscription() {
        let (tx, rx) = mpsc::channel::<WatchItem<LiteObj>>(4);
        let sub = Subscription::new(ChannelId::generate(), rx, CancelHandle::new(None));
        let handle = sub.cancel_handle();
        drop(sub);
        assert!(handle.is_cancelled());
        assert!(tx.is_closed());
    }

    #[test]
    fn channel_ids_are_distinct() {
        assert_ne!(ChannelId::generate(), ChannelId::generate());
        assert!(ChannelId::generate().to_string().starts_with("watch-"));
    }
}
