//! The seam between the sync mechanism and the application's query cache.

use crate::sse::types::QueryKey;
use std::sync::Arc;

/// A keyed, subscribable data cache that can be told a partition is stale.
///
/// The sync mechanism never reads or writes cached data; it only calls
/// [`SharedCache::invalidate`]. The call happens while the connection manager
/// holds its state lock, so implementations must not call back into the manager
/// and should hand any refetch work off to a task.
pub trait SharedCache: Send + Sync + 'static {
    /// Marks `key` stale, scheduling a refetch for any active subscriber.
    fn invalidate(&self, key: &QueryKey);
}

impl<C: SharedCache + ?Sized> SharedCache for Arc<C> {
    fn invalidate(&self, key: &QueryKey) {
        (**self).invalidate(key)
    }
}
