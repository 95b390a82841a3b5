//! Error taxonomy shared by every Kite crate.

use serde::{Deserialize, Serialize};

/// Failures while turning a namespace selection into a query or write target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ScopeError {
    #[error("invalid namespace name: {0:?}")]
    InvalidNamespace(String),
    #[error("no target namespace for namespaced kind {0}")]
    NoWriteTarget(String),
    #[error("namespaced kind {0} needs a namespace scope")]
    Unscoped(String),
}

/// Errors suitable for surfacing in a view and crossing task boundaries.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum KiteError {
    /// Network, auth or server-side failure of list/watch/create/update/delete.
    #[error("transport: {0}")]
    Transport(String),
    #[error("scope: {0}")]
    Scope(#[from] ScopeError),
    /// A change-notification channel closed while its consumer was still active.
    #[error("subscription lost: channel {channel}")]
    SubscriptionLost { channel: String },
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("synchronizer detached")]
    Detached,
}

impl KiteError {
    /// Whether a caller can reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KiteError::Transport(_) | KiteError::SubscriptionLost { .. })
    }
}

pub type KiteResult<T> = Result<T, KiteError>;
