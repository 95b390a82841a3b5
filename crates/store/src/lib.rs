//! Kite store: TTL snapshot cache shared across views, and the keyed live list
//! each synchronizer merges change events into.

#![forbid(unsafe_code)]

mod cache;
mod live;

pub use cache::{CacheKey, CollectionSnapshot, SnapshotCache};
pub use live::{Applied, LiveList};
