//! Kite core types: resource identity, lightweight objects and change events.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod ordering;
pub mod scope;

pub use config::SyncConfig;
pub use error::{KiteError, KiteResult, ScopeError};
pub use ordering::{natural_cmp, sort_items, FieldAccessors, FieldValue, SortDirection};
pub use scope::{resolve, NamespaceScope, ScopeQuery, ScopeSelection, ALL_NAMESPACES};

pub type Uid = [u8; 16];

/// A served Kubernetes resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, namespaced: bool) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced }
    }

    /// `v1/Pod` for the core group, `apps/v1/Deployment` otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity of a resource instance within a collection.
/// Cluster-scoped objects carry no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Anything that can live in a synchronized collection.
pub trait Resource: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;

    /// Server-side version (`metadata.resourceVersion`) when known.
    fn version(&self) -> Option<&str> { None }

    fn key(&self) -> ResourceKey {
        ResourceKey { namespace: self.namespace().map(str::to_string), name: self.name().to_string() }
    }

    /// Borrowing comparison against a key; avoids allocating in linear scans.
    fn has_key(&self, key: &ResourceKey) -> bool {
        self.name() == key.name && self.namespace() == key.namespace.as_deref()
    }
}

/// Lightweight shape of a Kubernetes object used by lists and views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiteObj {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    pub creation_ts: i64,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
}

impl Resource for LiteObj {
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    fn version(&self) -> Option<&str> { self.resource_version.as_deref() }
}

impl LiteObj {
    /// Shape a raw Kubernetes JSON object. `metadata.name` and `metadata.uid` are required.
    pub fn from_raw(raw: &serde_json::Value) -> KiteResult<Self> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| KiteError::Malformed("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KiteError::Malformed("object missing metadata.name".into()))?
            .to_string();
        let uid_str = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KiteError::Malformed(format!("{}: missing metadata.uid", name)))?;
        let uid = *uuid::Uuid::parse_str(uid_str)
            .map_err(|e| KiteError::Malformed(format!("{}: invalid uid: {}", name, e)))?
            .as_bytes();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = SmallVec::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() { labels.push((k.clone(), val.to_string())); }
            }
        }
        Ok(LiteObj { uid, namespace, name, resource_version, creation_ts, labels })
    }
}

/// A single change notification for one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChangeEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> ChangeEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            ChangeEvent::Added(o) | ChangeEvent::Modified(o) | ChangeEvent::Deleted(o) => o,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Modified(_) => "modified",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }
}

pub mod prelude {
    pub use super::{ChangeEvent, KiteError, KiteResult, LiteObj, NamespaceScope, Resource, ResourceKey, ResourceKind, Uid};
}
