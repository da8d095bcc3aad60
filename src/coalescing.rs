// realtime-sync-kit/src/coalescing.rs

//! Keyed de-duplication of in-flight async operations.
//!
//! A burst of push events can invalidate the same partition several times in a
//! row; routing every refetch through a `CoalescingService` keyed by the
//! partition means subscribers trigger one fetch per burst instead of one per event.

use anyhow::Error;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{Instrument, debug, info_span, instrument, warn};

/// Outcome shared between every caller waiting on the same key.
type SharedOutcome<T> = Arc<Result<Arc<T>, Arc<Error>>>;

type SharedOp<T> = Shared<BoxFuture<'static, SharedOutcome<T>>>;

/// Returned (inside `anyhow::Error`) when an operation exceeds the service timeout.
#[derive(Debug, thiserror::Error)]
#[error("operation for {key} timed out after {after:?}")]
pub struct TimedOut {
    pub key: String,
    pub after: Duration,
}

/// Counters for monitoring the service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoalescingStats {
    /// Operations actually started (first caller for a key).
    pub initiated: usize,
    /// Callers that joined an operation already in flight.
    pub coalesced: usize,
    /// Started operations that returned an error (timeouts excluded).
    pub failed: usize,
    /// Started operations cut off by the timeout.
    pub timed_out: usize,
}

/// Runs at most one operation per key at a time; concurrent callers for the
/// same key share its result.
#[derive(Debug)]
pub struct CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    in_flight: Arc<Mutex<HashMap<K, SharedOp<T>>>>,
    timeout: Option<Duration>,
    stats: Arc<Mutex<CoalescingStats>>,
}

impl<K, T> CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            timeout: None,
            stats: Arc::new(Mutex::new(CoalescingStats::default())),
        }
    }

    /// Operations running longer than `timeout` fail with [`TimedOut`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Runs `operation` for `key`, or waits for the run already in flight.
    ///
    /// `operation` is only called when no run for `key` is in progress. The key
    /// is released as soon as the run finishes, so a later call starts afresh.
    #[instrument(skip(self, operation), fields(key = ?key))]
    pub async fn execute<F, Fut>(&self, key: K, operation: F) -> Result<Arc<T>, Arc<Error>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
    {
        let shared_op = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                debug!("Joining operation already in flight");
                self.stats.lock().await.coalesced += 1;
                existing.clone()
            } else {
                self.stats.lock().await.initiated += 1;
                let op = self.shared_op(key.clone(), operation);
                in_flight.insert(key, op.clone());
                op
            }
        };

        match &*shared_op.await {
            Ok(value) => Ok(Arc::clone(value)),
            Err(e) => Err(Arc::clone(e)),
        }
    }

    fn shared_op<F, Fut>(&self, key: K, operation: F) -> SharedOp<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let stats = Arc::clone(&self.stats);
        let limit = self.timeout;
        let span = info_span!("coalesced_op", key = ?key);

        async move {
            let result = match limit {
                Some(after) => match timeout(after, operation()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(?after, "Operation timed out");
                        Err(Error::new(TimedOut {
                            key: format!("{key:?}"),
                            after,
                        }))
                    }
                },
                None => operation().await,
            };

            // Release the key before anyone observes the outcome.
            in_flight.lock().await.remove(&key);

            let outcome = match result {
                Ok(value) => Ok(Arc::new(value)),
                Err(e) => {
                    let mut stats = stats.lock().await;
                    if e.is::<TimedOut>() {
                        stats.timed_out += 1;
                    } else {
                        warn!(error = %e, "Operation failed");
                        stats.failed += 1;
                    }
                    Err(Arc::new(e))
                }
            };
            Arc::new(outcome)
        }
        .instrument(span)
        .boxed()
        .shared()
    }

    pub async fn stats(&self) -> CoalescingStats {
        self.stats.lock().await.clone()
    }

    /// Number of keys with an operation currently running.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = CoalescingStats::default();
    }
}

impl<K, T> Clone for CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<K, T> Default for CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::types::QueryKey;
    use anyhow::anyhow;
    use once_cell::sync::Lazy;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });

    // Stands in for a REST call backing one partition.
    async fn fetch_partition(key: QueryKey, calls: Arc<AtomicUsize>) -> Result<Value, Error> {
        calls.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        if key.segments().first().map(String::as_str) == Some("broken") {
            Err(anyhow!("backend refused {key}"))
        } else {
            Ok(json!({ "partition": key.to_string() }))
        }
    }

    #[tokio::test]
    async fn test_concurrent_refetches_share_one_call() {
        Lazy::force(&TRACING);
        let service: CoalescingService<QueryKey, Value> = CoalescingService::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::from(["planning"]);

        let mut handles = vec![];
        for _ in 0..5 {
            let svc = service.clone();
            let k = key.clone();
            let c = calls.clone();
            handles.push(tokio::spawn(async move {
                svc.execute(k.clone(), move || fetch_partition(k, c)).await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().expect("fetch should succeed");
            assert_eq!(*value, json!({ "partition": "planning" }));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = service.stats().await;
        assert_eq!(stats.initiated, 1);
        assert_eq!(stats.coalesced, 4);
        assert_eq!(stats.failed, 0);
        assert_eq!(service.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_counted_once() {
        Lazy::force(&TRACING);
        let service: CoalescingService<QueryKey, Value> = CoalescingService::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::from(["broken", "feed"]);

        let mut handles = vec![];
        for _ in 0..3 {
            let svc = service.clone();
            let k = key.clone();
            let c = calls.clone();
            handles.push(tokio::spawn(async move {
                svc.execute(k.clone(), move || fetch_partition(k, c)).await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().expect_err("fetch should fail");
            assert!(err.to_string().contains("backend refused broken/feed"), "{err}");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = service.stats().await;
        assert_eq!(stats.initiated, 1);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(service.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_key() {
        Lazy::force(&TRACING);
        let service: CoalescingService<QueryKey, Value> =
            CoalescingService::with_timeout(Duration::from_millis(20));
        let key = QueryKey::from(["meteo"]);

        let mut handles = vec![];
        for _ in 0..3 {
            let svc = service.clone();
            let k = key.clone();
            handles.push(tokio::spawn(async move {
                svc.execute(k, || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok(Value::Null)
                })
                .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().expect_err("fetch should time out");
            let timed_out = err.downcast_ref::<TimedOut>().expect("typed timeout error");
            assert_eq!(timed_out.after, Duration::from_millis(20));
            assert!(timed_out.key.contains("meteo"));
        }

        let stats = service.stats().await;
        assert_eq!(stats.initiated, 1);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(service.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_independent_keys_run_separately() {
        Lazy::force(&TRACING);
        let service: CoalescingService<QueryKey, Value> = CoalescingService::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let docs = QueryKey::from(["documents"]);
        let feed = QueryKey::from(["feed"]);
        let (a, b) = tokio::join!(
            service.execute(docs.clone(), {
                let c = calls.clone();
                move || fetch_partition(docs, c)
            }),
            service.execute(feed.clone(), {
                let c = calls.clone();
                move || fetch_partition(feed, c)
            }),
        );

        assert_eq!(*a.unwrap(), json!({ "partition": "documents" }));
        assert_eq!(*b.unwrap(), json!({ "partition": "feed" }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = service.stats().await;
        assert_eq!(stats.initiated, 2);
        assert_eq!(stats.coalesced, 0);

        service.reset_stats().await;
        assert_eq!(service.stats().await, CoalescingStats::default());
    }
}
