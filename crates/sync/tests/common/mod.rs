#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kite_api::MockTransport;
use kite_core::{LiteObj, ResourceKind, SyncConfig};
use kite_store::SnapshotCache;
use kite_sync::{SyncView, Synchronizer};

pub fn pods() -> ResourceKind { ResourceKind::new("", "v1", "Pod", true) }

pub fn nodes() -> ResourceKind { ResourceKind::new("", "v1", "Node", false) }

pub fn pod(n: u8, ns: &str, name: &str, rv: &str) -> LiteObj {
    let mut uid = [0u8; 16];
    uid[0] = n;
    LiteObj {
        uid,
        namespace: Some(ns.to_string()),
        name: name.to_string(),
        resource_version: Some(rv.to_string()),
        creation_ts: n as i64,
        labels: Default::default(),
    }
}

pub fn manifest(name: &str) -> serde_json::Value {
    serde_json::json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": name } })
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..SyncConfig::default()
    }
}

pub fn setup(config: SyncConfig) -> (Arc<MockTransport>, Arc<SnapshotCache<LiteObj>>, Synchronizer<MockTransport>) {
    let mock = Arc::new(MockTransport::with_capacity(config.queue_cap));
    let cache = Arc::new(SnapshotCache::new());
    let sync = Synchronizer::new(Arc::clone(&mock), Arc::clone(&cache), pods(), Some("kind-dev"), config);
    (mock, cache, sync)
}

pub fn names(view: &SyncView<LiteObj>) -> Vec<String> { view.items.iter().map(|o| o.name.clone()).collect() }

/// Wait for a published view satisfying `pred`.
pub async fn wait_until(
    sync: &Synchronizer<MockTransport>,
    pred: impl Fn(&SyncView<LiteObj>) -> bool,
) -> Arc<SyncView<LiteObj>> {
    let mut rx = sync.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = sync.view();
            if pred(&view) {
                return view;
            }
            rx.changed().await.expect("epoch sender alive");
        }
    })
    .await
    .expect("view condition not reached in time")
}
