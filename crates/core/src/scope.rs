//! Namespace scope resolution.
//!
//! A user selection is a list of namespace names which may contain the
//! [`ALL_NAMESPACES`] sentinel. [`resolve`] turns it into a [`ScopeQuery`]:
//! the effective [`NamespaceScope`] plus the default namespace for writes.
//! Cluster-scoped kinds never carry a scope at all (`None`), which keeps
//! "no namespace scoping applies" apart from "all namespaces".

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ResourceKind, ScopeError};

/// Selection value meaning "every namespace". Underscores are not valid in
/// namespace names, so this cannot collide with a real namespace.
pub const ALL_NAMESPACES: &str = "__all__";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceScope {
    All,
    /// Non-empty set of concrete namespaces.
    Only(BTreeSet<String>),
}

impl NamespaceScope {
    /// Concrete scope from names; an empty input collapses to [`NamespaceScope::All`].
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if set.is_empty() { NamespaceScope::All } else { NamespaceScope::Only(set) }
    }

    pub fn is_all(&self) -> bool { matches!(self, NamespaceScope::All) }

    pub fn namespaces(&self) -> Option<&BTreeSet<String>> {
        match self {
            NamespaceScope::All => None,
            NamespaceScope::Only(set) => Some(set),
        }
    }

    /// Membership check. Objects without a namespace only pass the "all" scope.
    pub fn admits(&self, namespace: Option<&str>) -> bool {
        match self {
            NamespaceScope::All => true,
            NamespaceScope::Only(set) => namespace.map(|ns| set.contains(ns)).unwrap_or(false),
        }
    }

    /// Short human label for logs.
    pub fn label(&self) -> String {
        match self {
            NamespaceScope::All => "(all)".to_string(),
            NamespaceScope::Only(set) => set.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

/// Result of resolving a namespace selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeQuery {
    pub scope: NamespaceScope,
    /// First selected namespace; used by creates that do not name a namespace.
    pub default_namespace: Option<String>,
}

/// Resolve a selection. Empty input or any sentinel entry means "all".
/// Blank entries are ignored and duplicates keep their first position.
pub fn resolve<S: AsRef<str>>(selected: &[S]) -> ScopeQuery {
    let mut ordered: Vec<&str> = Vec::with_capacity(selected.len());
    for s in selected.iter().map(|s| s.as_ref().trim()) {
        if s == ALL_NAMESPACES {
            return ScopeQuery { scope: NamespaceScope::All, default_namespace: None };
        }
        if !s.is_empty() && !ordered.contains(&s) {
            ordered.push(s);
        }
    }
    let default_namespace = ordered.first().map(|s| s.to_string());
    ScopeQuery { scope: NamespaceScope::only(ordered), default_namespace }
}

impl ScopeQuery {
    pub fn all() -> Self { Self { scope: NamespaceScope::All, default_namespace: None } }

    /// Scope to hand to the synchronizer for `kind`: `None` for cluster-scoped kinds.
    pub fn scope_for(&self, kind: &ResourceKind) -> Result<Option<NamespaceScope>, ScopeError> {
        if !kind.namespaced {
            return Ok(None);
        }
        if let Some(set) = self.scope.namespaces() {
            if let Some(bad) = set.iter().find(|ns| !is_valid_namespace(ns)) {
                return Err(ScopeError::InvalidNamespace(bad.clone()));
            }
        }
        Ok(Some(self.scope.clone()))
    }

    /// Target namespace for a create/update of `kind`. An explicit namespace wins.
    pub fn write_namespace(&self, kind: &ResourceKind, explicit: Option<&str>) -> Result<Option<String>, ScopeError> {
        if !kind.namespaced {
            return Ok(None);
        }
        let ns = explicit
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .or_else(|| self.default_namespace.clone())
            .ok_or_else(|| ScopeError::NoWriteTarget(kind.gvk_key()))?;
        if !is_valid_namespace(&ns) {
            return Err(ScopeError::InvalidNamespace(ns));
        }
        Ok(Some(ns))
    }
}

/// DNS-1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, at most 63 chars.
pub fn is_valid_namespace(ns: &str) -> bool {
    let b = ns.as_bytes();
    if b.is_empty() || b.len() > 63 {
        return false;
    }
    let ok = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    ok(&b[0]) && ok(&b[b.len() - 1]) && b.iter().all(|c| ok(c) || *c == b'-')
}

/// Namespace selection bound to a cluster context. Switching context resets to "all"
/// so a selection never leaks into a cluster where it may not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelection {
    context: Option<String>,
    selected: Vec<String>,
}

impl ScopeSelection {
    pub fn new(context: Option<&str>) -> Self {
        Self { context: context.map(str::to_string), selected: Vec::new() }
    }

    pub fn context(&self) -> Option<&str> { self.context.as_deref() }
    pub fn selected(&self) -> &[String] { &self.selected }

    /// Returns true when the context actually changed (and the selection was reset).
    pub fn set_context(&mut self, context: Option<&str>) -> bool {
        if self.context.as_deref() == context {
            return false;
        }
        tracing::debug!(from = ?self.context, to = ?context, "scope: context changed, resetting selection");
        self.context = context.map(str::to_string);
        self.selected.clear();
        true
    }

    pub fn select<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = names.into_iter().map(Into::into).collect();
    }

    pub fn query(&self) -> ScopeQuery { resolve(&self.selected) }
}
