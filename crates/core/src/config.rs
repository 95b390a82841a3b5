//! Runtime configuration read from `KITE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_TTL_MS: u64 = 5_000;
pub const DEFAULT_QUEUE_CAP: usize = 2048;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Lifetime of a cached list snapshot.
    pub cache_ttl: Duration,
    /// Capacity of per-subscription event channels.
    pub queue_cap: usize,
    /// Re-list and re-subscribe when a subscription is lost.
    pub reconnect: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            queue_cap: DEFAULT_QUEUE_CAP,
            reconnect: true,
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

impl SyncConfig {
    /// Build from the process environment. Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let cache_ttl = get("KITE_CACHE_TTL_MS").and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.cache_ttl);
        let queue_cap = get("KITE_QUEUE_CAP").and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.queue_cap);
        let reconnect = get("KITE_WATCH_RECONNECT").and_then(|s| parse_bool(&s)).unwrap_or(d.reconnect);
        let backoff_initial = get("KITE_WATCH_BACKOFF_INITIAL_MS").and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.backoff_initial);
        let backoff_max = get("KITE_WATCH_BACKOFF_MAX_SECS").and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.backoff_max);
        let cfg = Self { cache_ttl, queue_cap, reconnect, backoff_initial, backoff_max: backoff_max.max(backoff_initial) };
        tracing::debug!(?cfg, "config: loaded");
        cfg
    }

    /// Delay before reconnect attempt `attempt` (0-based): doubles from `backoff_initial`, capped at `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_initial.saturating_mul(factor).min(self.backoff_max)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
