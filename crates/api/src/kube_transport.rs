use std::time::Instant;

use kite_core::{ChangeEvent, KiteError, KiteResult, LiteObj, NamespaceScope, ResourceKey, ResourceKind, SyncConfig};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{CancelHandle, ChannelId, Subscription, Transport};

/// Transport backed by a kube client for one kubeconfig context.
pub struct KubeTransport {
    client: kube::Client,
    context: Option<String>,
    queue_cap: usize,
}

impl KubeTransport {
    pub async fn connect(context: Option<&str>, config: &SyncConfig) -> KiteResult<Self> {
        let client = kite_kubehub::client_for_context(context).await.map_err(Self::map_err)?;
        info!(context = %context.unwrap_or("(default)"), "api: kube transport connected");
        Ok(Self::from_client(client, context, config.queue_cap))
    }

    pub fn from_client(client: kube::Client, context: Option<&str>, queue_cap: usize) -> Self {
        Self { client, context: context.map(str::to_string), queue_cap: queue_cap.max(1) }
    }

    pub fn context(&self) -> Option<&str> { self.context.as_deref() }

    fn map_err(e: anyhow::Error) -> KiteError { KiteError::Transport(format!("{:#}", e)) }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    type Item = LiteObj;

    async fn list(&self, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> KiteResult<Vec<LiteObj>> {
        let t0 = Instant::now();
        let res = kite_kubehub::list(&self.client, kind, scope).await.map_err(Self::map_err);
        histogram!("kite_api_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(items) => info!(gvk = %kind.gvk_key(), items = items.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok"),
            Err(e) => warn!(gvk = %kind.gvk_key(), error = %e, took_ms = %t0.elapsed().as_millis(), "api: list failed"),
        }
        res
    }

    async fn watch(&self, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> KiteResult<Subscription<LiteObj>> {
        let channel = ChannelId::generate();
        let (tx, rx) = mpsc::channel::<KiteResult<ChangeEvent<LiteObj>>>(self.queue_cap);
        let client = self.client.clone();
        let kind_owned = kind.clone();
        let scope_owned = scope.cloned();
        info!(gvk = %kind.gvk_key(), channel = %channel, "api: watch start");
        counter!("kite_api_watch_opened_total", 1);
        let task = tokio::spawn(async move {
            let gvk = kind_owned.gvk_key();
            if let Err(e) = kite_kubehub::start_watcher(client, kind_owned, scope_owned, tx).await {
                warn!(gvk = %gvk, channel = %channel, error = %format!("{:#}", e), "api: watcher failed");
            }
            info!(gvk = %gvk, channel = %channel, "api: watcher task ended");
        });
        Ok(Subscription::new(channel, rx, CancelHandle::new(Some(task))))
    }

    async fn create(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<LiteObj> {
        let t0 = Instant::now();
        let created = kite_kubehub::create(&self.client, kind, namespace, manifest).await.map_err(Self::map_err)?;
        info!(gvk = %kind.gvk_key(), name = %created.name, took_ms = %t0.elapsed().as_millis(), "api: create ok");
        Ok(created)
    }

    async fn update(&self, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> KiteResult<LiteObj> {
        let t0 = Instant::now();
        let updated = kite_kubehub::replace(&self.client, kind, namespace, manifest).await.map_err(Self::map_err)?;
        info!(gvk = %kind.gvk_key(), name = %updated.name, took_ms = %t0.elapsed().as_millis(), "api: update ok");
        Ok(updated)
    }

    async fn delete(&self, kind: &ResourceKind, keys: &[ResourceKey]) -> Vec<KiteResult<()>> {
        match kite_kubehub::delete(&self.client, kind, keys).await {
            Ok(results) => results.into_iter().map(|r| r.map_err(Self::map_err)).collect(),
            Err(e) => {
                counter!("kite_api_write_failures_total", keys.len() as u64, "op" => "delete");
                let err = Self::map_err(e);
                keys.iter().map(|_| Err(err.clone())).collect()
            }
        }
    }
}
