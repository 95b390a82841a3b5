use std::sync::Arc;

use kite_core::Resource;
use metrics::counter;
use tracing::debug;

use crate::state::{Shared, SyncPhase};

/// Splices locally confirmed writes into a synchronizer's list ahead of the
/// matching change notification.
///
/// Call only after the remote write succeeded. When the Added/Modified event
/// for the same key arrives later, the synchronizer's ordinary upsert replaces
/// the optimistic entry in place.
pub struct OptimisticOverlay<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for OptimisticOverlay<T> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<T: Resource> OptimisticOverlay<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self { Self { shared } }

    /// Prepend a created entity if it is within the active scope and its key is not listed yet.
    pub fn on_local_create(&self, entity: T) -> bool {
        let key = entity.key();
        let mut st = self.shared.lock();
        if st.detached || st.phase == SyncPhase::Idle {
            return false;
        }
        let inserted = st.live.insert_front(entity);
        if inserted {
            self.shared.publish(&mut st);
            counter!("kite_overlay_inserts_total", 1);
        }
        debug!(key = %key, inserted, "overlay: local create");
        inserted
    }

    /// Replace an updated entity in place. Entities not currently listed are left to the event stream.
    pub fn on_local_update(&self, entity: T) -> bool {
        let key = entity.key();
        let mut st = self.shared.lock();
        if st.detached || st.phase == SyncPhase::Idle {
            return false;
        }
        let replaced = st.live.replace_existing(entity);
        if replaced {
            self.shared.publish(&mut st);
        }
        debug!(key = %key, replaced, "overlay: local update");
        replaced
    }
}
