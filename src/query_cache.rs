//! In-memory query cache that reacts to invalidations like TanStack Query does.

use crate::cache::SharedCache;
use crate::coalescing::{CoalescingService, CoalescingStats};
use crate::sse::types::QueryKey;
use anyhow::anyhow;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// What subscribers of one partition see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    /// Set by invalidation, cleared by the next successful fetch.
    pub stale: bool,
    /// Message of the last failed fetch, cleared on success.
    pub error: Option<String>,
    /// Completed fetches, successful or not.
    pub fetches: u64,
}

struct Partition {
    fetcher: Fetcher,
    tx: watch::Sender<QueryState>,
    /// Bumped by every invalidation. A fetch only clears `stale` if no
    /// invalidation landed while it ran.
    generation: AtomicU64,
    /// Generation of the newest fetch whose outcome has been stored.
    applied: AtomicU64,
}

/// A keyed cache of server data with per-partition fetchers and subscribers.
///
/// Invalidating a key marks every registered partition under it stale (prefix
/// match) and refetches the ones somebody is subscribed to. Refetches for one
/// partition are coalesced, but never across an invalidation: a fetch already
/// running when the partition is invalidated cannot satisfy the refetch.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<DashMap<QueryKey, Partition>>,
    fetches: CoalescingService<(QueryKey, u64), Value>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("partitions", &self.entries.len())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            fetches: CoalescingService::new(),
        }
    }

    /// Fetches that run longer than `timeout` are recorded as failed.
    pub fn with_fetch_timeout(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            fetches: CoalescingService::with_timeout(timeout),
        }
    }

    /// Declares how `key` is fetched. Re-registering replaces the fetcher and keeps the state.
    pub fn register<F, Fut>(&self, key: impl Into<QueryKey>, fetcher: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || fetcher().boxed());
        match self.entries.entry(key.into()) {
            MapEntry::Occupied(mut occupied) => occupied.get_mut().fetcher = fetcher,
            MapEntry::Vacant(vacant) => {
                let (tx, _) = watch::channel(QueryState::default());
                vacant.insert(Partition {
                    fetcher,
                    tx,
                    generation: AtomicU64::new(0),
                    applied: AtomicU64::new(0),
                });
            }
        }
    }

    /// Subscribes to a registered partition. While the receiver lives the
    /// partition counts as active and is refetched on invalidation.
    pub fn subscribe(&self, key: &QueryKey) -> Option<watch::Receiver<QueryState>> {
        self.entries.get(key).map(|entry| entry.tx.subscribe())
    }

    pub fn state(&self, key: &QueryKey) -> Option<QueryState> {
        self.entries.get(key).map(|entry| entry.tx.borrow().clone())
    }

    pub fn stale_keys(&self) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|entry| entry.tx.borrow().stale)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Fetches `key`, joining a fetch already in flight for it unless the
    /// partition was invalidated after that fetch started.
    pub async fn fetch(&self, key: &QueryKey) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        let (fetcher, generation) = match self.entries.get(key) {
            Some(entry) => (
                Arc::clone(&entry.fetcher),
                entry.generation.load(Ordering::SeqCst),
            ),
            None => return Err(Arc::new(anyhow!("no query registered for {key}"))),
        };
        let entries = Arc::clone(&self.entries);
        let target = key.clone();

        self.fetches
            .execute((key.clone(), generation), move || async move {
                let result = fetcher().await;
                if let Some(entry) = entries.get(&target) {
                    entry.tx.send_modify(|state| {
                        state.fetches += 1;
                        // An older fetch finishing late must not overwrite a newer outcome.
                        if entry.applied.fetch_max(generation, Ordering::SeqCst) > generation {
                            return;
                        }
                        match &result {
                            Ok(value) => {
                                state.data = Some(Arc::new(value.clone()));
                                state.error = None;
                                if entry.generation.load(Ordering::SeqCst) == generation {
                                    state.stale = false;
                                }
                            }
                            Err(e) => state.error = Some(e.to_string()),
                        }
                    });
                }
                result
            })
            .await
    }

    pub async fn fetch_stats(&self) -> CoalescingStats {
        self.fetches.stats().await
    }
}

impl SharedCache for QueryCache {
    fn invalidate(&self, key: &QueryKey) {
        let mut active = Vec::new();
        for entry in self.entries.iter().filter(|entry| entry.key().starts_with(key)) {
            entry.generation.fetch_add(1, Ordering::SeqCst);
            entry.tx.send_modify(|state| state.stale = true);
            if entry.tx.receiver_count() > 0 {
                active.push(entry.key().clone());
            }
        }
        debug!(%key, refetching = active.len(), "Invalidated cached partitions");

        if active.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(%key, "No async runtime, stale partitions will refetch on next use");
            return;
        };
        for partition in active {
            let cache = self.clone();
            runtime.spawn(async move {
                if let Err(e) = cache.fetch(&partition).await {
                    warn!(%partition, error = %e, "Background refetch failed");
                }
            });
        }
    }
}
