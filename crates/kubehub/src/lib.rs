//! Kite kubehub: kube-rs wiring for list, watch and writes against one cluster context.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{stream, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery,
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, Config,
};
use kite_core::{ChangeEvent, KiteResult, LiteObj, NamespaceScope, ResourceKey, ResourceKind};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod tracker;

pub use tracker::KeyTracker;

/// Sender half of a subscription channel. Items that fail to shape are sent as `Err`.
pub type EventSender = mpsc::Sender<KiteResult<ChangeEvent<LiteObj>>>;

/// Build a client for a kubeconfig context, or the default context when `None`.
pub async fn client_for_context(context: Option<&str>) -> Result<Client> {
    match context {
        None => Client::try_default().await.context("building default kube client"),
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let cfg = Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", ctx))?;
            Client::try_from(cfg).context("building kube client")
        }
    }
}

/// Resolve the served ApiResource (plural, scope) for a kind.
pub async fn resolve_api_resource(client: &Client, kind: &ResourceKind) -> Result<ApiResource> {
    let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
    let (ar, _caps) = discovery::pinned_kind(client, &gvk)
        .await
        .with_context(|| format!("resolving {}", kind.gvk_key()))?;
    Ok(ar)
}

/// One Api per namespace of a concrete scope; a single cluster-wide Api otherwise.
fn apis_for(client: &Client, ar: &ApiResource, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> Vec<Api<DynamicObject>> {
    match (kind.namespaced, scope) {
        (true, Some(NamespaceScope::Only(set))) => set.iter().map(|ns| Api::namespaced_with(client.clone(), ns, ar)).collect(),
        _ => vec![Api::all_with(client.clone(), ar)],
    }
}

fn write_api(client: &Client, ar: &ApiResource, kind: &ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    if kind.namespaced {
        let ns = namespace.ok_or_else(|| anyhow!("namespace required for namespaced kind {}", kind.gvk_key()))?;
        Ok(Api::namespaced_with(client.clone(), ns, ar))
    } else {
        Ok(Api::all_with(client.clone(), ar))
    }
}

fn lite_from(obj: &DynamicObject) -> KiteResult<LiteObj> {
    let raw = serde_json::to_value(obj).map_err(|e| kite_core::KiteError::Malformed(e.to_string()))?;
    LiteObj::from_raw(&raw)
}

fn scope_label(scope: Option<&NamespaceScope>) -> String {
    scope.map(|s| s.label()).unwrap_or_else(|| "(cluster)".to_string())
}

/// List every object of `kind` within `scope`. Objects that cannot be shaped are skipped.
pub async fn list(client: &Client, kind: &ResourceKind, scope: Option<&NamespaceScope>) -> Result<Vec<LiteObj>> {
    let ar = resolve_api_resource(client, kind).await?;
    let mut out = Vec::new();
    for api in apis_for(client, &ar, kind, scope) {
        let page = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {}", kind.gvk_key()))?;
        for obj in page.items.iter() {
            match lite_from(obj) {
                Ok(o) => out.push(o),
                Err(e) => warn!(gvk = %kind.gvk_key(), error = %e, "kubehub: skipping unshapeable object"),
            }
        }
    }
    debug!(gvk = %kind.gvk_key(), ns = %scope_label(scope), items = out.len(), "kubehub: list done");
    Ok(out)
}

/// Watch `kind` within `scope` and forward Added/Modified/Deleted events into `tx`.
///
/// Each namespace of a concrete scope gets its own watcher; their streams are merged.
/// Watcher relists are diffed against the keys last seen on that stream. Returns when
/// the receiver is dropped or every underlying stream ends.
pub async fn start_watcher(client: Client, kind: ResourceKind, scope: Option<NamespaceScope>, tx: EventSender) -> Result<()> {
    let ar = resolve_api_resource(&client, &kind).await?;
    let apis = apis_for(&client, &ar, &kind, scope.as_ref());
    let mut trackers: Vec<KeyTracker<LiteObj>> = (0..apis.len()).map(|_| KeyTracker::new()).collect();
    let streams = apis.into_iter().enumerate().map(|(i, api)| {
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |ev| (i, ev))
            .boxed()
    });
    let mut merged = stream::select_all(streams);
    let gvk = kind.gvk_key();
    info!(gvk = %gvk, ns = %scope_label(scope.as_ref()), "kubehub: watcher started");
    while let Some((i, ev)) = merged.next().await {
        let tracker = &mut trackers[i];
        let out: Vec<KiteResult<ChangeEvent<LiteObj>>> = match ev {
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "kubehub: watch error; retrying with backoff");
                counter!("kite_kubehub_watch_errors_total", 1);
                continue;
            }
            Ok(Event::Applied(o)) => lite_from(&o).map(|lo| tracker.applied(lo)).transpose().into_iter().collect(),
            Ok(Event::Deleted(o)) => vec![lite_from(&o).map(|lo| tracker.deleted(lo))],
            Ok(Event::Restarted(list)) => {
                debug!(gvk = %gvk, count = list.len(), "kubehub: watch restart");
                let mut shaped = Vec::with_capacity(list.len());
                let mut out = Vec::new();
                for o in list.iter() {
                    match lite_from(o) {
                        Ok(lo) => shaped.push(lo),
                        Err(e) => out.push(Err(e)),
                    }
                }
                out.extend(tracker.restarted(shaped).into_iter().map(Ok));
                out
            }
        };
        for item in out {
            counter!("kite_kubehub_events_total", 1, "gvk" => gvk.clone());
            if tx.send(item).await.is_err() {
                debug!(gvk = %gvk, "kubehub: receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(gvk = %gvk, "kubehub: watcher stream ended");
    Ok(())
}

/// Create an object from a JSON manifest. `namespace` overrides the manifest's own.
pub async fn create(client: &Client, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> Result<LiteObj> {
    let ar = resolve_api_resource(client, kind).await?;
    let mut obj: DynamicObject = serde_json::from_value(manifest).context("manifest is not a Kubernetes object")?;
    if let Some(ns) = namespace {
        obj.metadata.namespace = Some(ns.to_string());
    }
    let api = write_api(client, &ar, kind, obj.metadata.namespace.as_deref())?;
    let created = api.create(&PostParams::default(), &obj).await.with_context(|| format!("creating {}", kind.gvk_key()))?;
    Ok(lite_from(&created)?)
}

/// Replace an existing object with the given manifest.
pub async fn replace(client: &Client, kind: &ResourceKind, namespace: Option<&str>, manifest: serde_json::Value) -> Result<LiteObj> {
    let ar = resolve_api_resource(client, kind).await?;
    let mut obj: DynamicObject = serde_json::from_value(manifest).context("manifest is not a Kubernetes object")?;
    if let Some(ns) = namespace {
        obj.metadata.namespace = Some(ns.to_string());
    }
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("manifest missing metadata.name"))?;
    let api = write_api(client, &ar, kind, obj.metadata.namespace.as_deref())?;
    let updated = api
        .replace(&name, &PostParams::default(), &obj)
        .await
        .with_context(|| format!("replacing {} {}", kind.gvk_key(), name))?;
    Ok(lite_from(&updated)?)
}

/// Delete objects by key. The outer error covers kind resolution; each key gets its own result.
pub async fn delete(client: &Client, kind: &ResourceKind, keys: &[ResourceKey]) -> Result<Vec<Result<()>>> {
    let ar = resolve_api_resource(client, kind).await?;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let res = match write_api(client, &ar, kind, key.namespace.as_deref()) {
            Ok(api) => api
                .delete(&key.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .with_context(|| format!("deleting {}", key)),
            Err(e) => Err(e),
        };
        if let Err(e) = &res {
            warn!(gvk = %kind.gvk_key(), key = %key, error = %e, "kubehub: delete failed");
        }
        out.push(res);
    }
    Ok(out)
}
