#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use realtime_sync_kit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_sync_kit=debug".into()),
        )
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Records every invalidation it is asked for.
#[derive(Default)]
pub struct RecordingCache {
    calls: Mutex<Vec<QueryKey>>,
}

impl RecordingCache {
    pub fn calls(&self) -> Vec<QueryKey> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<QueryKey> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl SharedCache for RecordingCache {
    fn invalidate(&self, key: &QueryKey) {
        self.calls.lock().unwrap().push(key.clone());
    }
}

/// A probe with a fixed answer that counts how often it is asked.
pub struct FixedProbe {
    outcome: ProbeOutcome,
    checks: AtomicUsize,
}

impl FixedProbe {
    pub fn new(outcome: ProbeOutcome) -> Self {
        Self {
            outcome,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointProbe for FixedProbe {
    async fn check(&self) -> ProbeOutcome {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

pub struct Fixture {
    pub manager: ConnectionManager,
    pub transport: ChannelTransport,
    pub cache: Arc<RecordingCache>,
    pub probe: Arc<FixedProbe>,
    pub network: NetworkMonitor,
}

pub fn fixture_with(online: bool, outcome: ProbeOutcome) -> Fixture {
    init_tracing();
    let transport = ChannelTransport::new();
    let cache = Arc::new(RecordingCache::default());
    let probe = Arc::new(FixedProbe::new(outcome));
    let network = NetworkMonitor::new(online);
    let manager = ConnectionManager::builder()
        .transport(Arc::new(transport.clone()))
        .probe(probe.clone())
        .cache(cache.clone())
        .network(network.clone())
        .build()
        .expect("fixture components are complete");
    Fixture {
        manager,
        transport,
        cache,
        probe,
        network,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(true, ProbeOutcome::Available)
}

/// Lets spawned tasks run until they block, without moving the paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
