//! The `ConnectionManager` that owns the push connection and feeds the router.

#[cfg(feature = "auth")]
use crate::auth::TokenProvider;
use crate::cache::SharedCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::sse::{
    backoff::Backoff,
    decoder::SseFrame,
    network::NetworkMonitor,
    probe::{AlwaysAvailable, EndpointProbe, OpenApiProbe, ProbeOutcome},
    router::{InvalidationMap, InvalidationRouter},
    transport::{HttpRequester, HttpSseTransport, PushTransport, TransportEvent},
    types::{ConnectionId, ConnectionSnapshot, ConnectionStatus},
};
use futures_util::StreamExt;
use reqwest::Client;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Pending,
    Passed,
    /// The endpoint does not exist; nothing connects for the rest of the session.
    Disabled,
}

struct SessionState {
    /// Bumped by every `start`/`stop`. A driver only acts while its epoch is current.
    epoch: u64,
    task: Option<JoinHandle<()>>,
    status: ConnectionStatus,
    reconnect_attempt: u32,
    pending_reconnect: Option<Duration>,
    probe: ProbeState,
}

struct Inner {
    state: Mutex<SessionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    router: InvalidationRouter,
    transport: Arc<dyn PushTransport>,
    probe: Arc<dyn EndpointProbe>,
    network: NetworkMonitor,
    backoff: Backoff,
}

/// How one connection ended.
enum ConnectionEnd {
    Failed,
    Offline,
    Cancelled,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Applies `update` and publishes the resulting status, unless `epoch` has
    /// been superseded by a `stop` or a newer `start`.
    fn update(&self, epoch: u64, update: impl FnOnce(&mut SessionState)) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        update(&mut state);
        self.publish(state.status);
        true
    }

    /// The driver task: probe once, then connect, back off and reconnect until cancelled.
    async fn drive(self: Arc<Self>, epoch: u64) {
        let mut online = self.network.subscribe();
        loop {
            let is_online = *online.borrow_and_update();
            if !is_online {
                let parked = self.update(epoch, |state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.pending_reconnect = None;
                });
                if !parked {
                    return;
                }
                debug!("Waiting for network connectivity before connecting");
                if !wait_until(&mut online, true).await {
                    return;
                }
                info!("Network back online, resuming push connection");
            }

            if !self.ensure_probed(epoch).await {
                return;
            }

            match self.run_connection(epoch, &mut online).await {
                ConnectionEnd::Cancelled => return,
                ConnectionEnd::Offline => continue,
                ConnectionEnd::Failed => {}
            }

            let Some(delay) = self.schedule_reconnect(epoch) else {
                return;
            };
            tokio::select! {
                biased;
                alive = wait_until(&mut online, false) => {
                    if !alive {
                        return;
                    }
                    // Loop top parks the session until the network returns.
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn ensure_probed(&self, epoch: u64) -> bool {
        let probe_state = self.lock().probe;
        match probe_state {
            ProbeState::Passed => return true,
            ProbeState::Disabled => return false,
            ProbeState::Pending => {}
        }

        let outcome = self.probe.check().await;

        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        match outcome {
            ProbeOutcome::Available => {
                state.probe = ProbeState::Passed;
                true
            }
            ProbeOutcome::Unavailable(reason) => {
                warn!(%reason, "Push endpoint unavailable, real-time sync disabled for this session");
                state.probe = ProbeState::Disabled;
                state.status = ConnectionStatus::Disconnected;
                state.pending_reconnect = None;
                self.publish(state.status);
                false
            }
        }
    }

    #[instrument(skip_all, fields(conn_id))]
    async fn run_connection(
        &self,
        epoch: u64,
        online: &mut watch::Receiver<bool>,
    ) -> ConnectionEnd {
        let conn_id = ConnectionId::new_v4();
        tracing::Span::current().record("conn_id", tracing::field::display(conn_id));

        let connecting = self.update(epoch, |state| {
            state.status = ConnectionStatus::Connecting;
            state.pending_reconnect = None;
        });
        if !connecting {
            return ConnectionEnd::Cancelled;
        }

        debug!("Opening push connection");
        let mut stream = self.transport.open();
        loop {
            tokio::select! {
                biased;
                alive = wait_until(online, false) => {
                    if !alive {
                        return ConnectionEnd::Cancelled;
                    }
                    info!("Network went offline, closing push connection");
                    let parked = self.update(epoch, |state| {
                        state.status = ConnectionStatus::Disconnected;
                        state.pending_reconnect = None;
                    });
                    return if parked { ConnectionEnd::Offline } else { ConnectionEnd::Cancelled };
                }
                event = stream.next() => match event {
                    Some(TransportEvent::Open) => {
                        let opened = self.update(epoch, |state| {
                            state.status = ConnectionStatus::Connected;
                            state.reconnect_attempt = 0;
                        });
                        if !opened {
                            return ConnectionEnd::Cancelled;
                        }
                        info!("Push connection established");
                    }
                    Some(TransportEvent::Frame(frame)) => {
                        if !self.deliver(epoch, &frame) {
                            return ConnectionEnd::Cancelled;
                        }
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, "Push transport error, closing connection");
                        return ConnectionEnd::Failed;
                    }
                    None => {
                        warn!("Push stream ended, closing connection");
                        return ConnectionEnd::Failed;
                    }
                },
            }
        }
    }

    /// Routes one frame while holding the state lock, so a concurrent `stop`
    /// either happens before (and the frame is dropped) or after the invalidations.
    fn deliver(&self, epoch: u64, frame: &SseFrame) -> bool {
        let state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        match self.router.handle_frame(frame) {
            Ok(invalidated) => debug!(invalidated, "Applied push event"),
            Err(e) => warn!(error = %e, data = %frame.data, "Dropping malformed push event"),
        }
        drop(state);
        true
    }

    fn schedule_reconnect(&self, epoch: u64) -> Option<Duration> {
        let mut state = self.lock();
        if state.epoch != epoch {
            return None;
        }
        let delay = self.backoff.delay(state.reconnect_attempt);
        state.reconnect_attempt = state.reconnect_attempt.saturating_add(1);
        state.status = ConnectionStatus::Errored;
        state.pending_reconnect = Some(delay);
        self.publish(state.status);
        warn!(
            attempt = state.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling push reconnect"
        );
        Some(delay)
    }
}

/// Resolves once the online flag equals `wanted`. False if the monitor is gone.
async fn wait_until(online: &mut watch::Receiver<bool>, wanted: bool) -> bool {
    online.wait_for(|up| *up == wanted).await.is_ok()
}

/// Keeps at most one live push connection and turns its events into cache invalidations.
///
/// Cloning yields another handle to the same connection. All failures are
/// handled internally: transport errors reconnect with exponential backoff,
/// malformed events are logged and dropped, and a backend without the push
/// endpoint disables the manager for the session. Callers only observe the
/// status, the reconnect attempt and the event counter.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("snapshot", &self.snapshot())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl ConnectionManager {
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::default()
    }

    /// Starts the connection in the background. Idempotent.
    ///
    /// While the network is offline nothing is probed or opened; the manager
    /// connects once it comes back online. Does nothing once the probe has
    /// disabled the session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.probe == ProbeState::Disabled {
            debug!("Push sync disabled for this session, ignoring start");
            return;
        }
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Push sync already running");
            return;
        }

        state.epoch += 1;
        let epoch = state.epoch;
        if self.inner.network.is_online() {
            info!("Starting push sync");
        } else {
            info!("Offline at start, push sync will connect when the network returns");
        }
        state.task = Some(tokio::spawn(Arc::clone(&self.inner).drive(epoch)));
    }

    /// Closes the connection and cancels any pending reconnect. Idempotent.
    ///
    /// Once this returns, the abandoned connection can no longer invalidate
    /// anything or change the status.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.epoch += 1;
        let was_running = match state.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        state.status = ConnectionStatus::Disconnected;
        state.pending_reconnect = None;
        self.inner.publish(state.status);
        if was_running {
            info!("Push sync stopped");
        }
    }

    /// Starts the connection and ties its lifetime to the returned guard.
    pub fn session(&self) -> SessionGuard {
        self.start();
        SessionGuard {
            manager: self.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().reconnect_attempt
    }

    pub fn events_received(&self) -> u64 {
        self.inner.router.events_received()
    }

    /// True once the probe found the push endpoint missing.
    pub fn is_disabled(&self) -> bool {
        self.inner.lock().probe == ProbeState::Disabled
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.inner.lock();
        ConnectionSnapshot {
            status: state.status,
            reconnect_attempt: state.reconnect_attempt,
            events_received: self.inner.router.events_received(),
            pending_reconnect: state.pending_reconnect,
        }
    }

    /// Follows status changes, e.g. to drive a "live" indicator.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn invalidation_map(&self) -> &InvalidationMap {
        self.inner.router.map()
    }
}

/// Stops the manager when dropped, like unmounting the UI scope that owns it.
#[must_use = "dropping the guard stops the push connection"]
#[derive(Debug)]
pub struct SessionGuard {
    manager: ConnectionManager,
}

impl SessionGuard {
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.stop();
    }
}

/// Assembles a [`ConnectionManager`].
///
/// A cache is always required. The transport and probe either come from a
/// [`SyncConfig`] (HTTP stream plus OpenAPI probe) or are given explicitly;
/// explicit components win.
#[derive(Default)]
pub struct ConnectionManagerBuilder {
    config: Option<SyncConfig>,
    client: Option<Client>,
    transport: Option<Arc<dyn PushTransport>>,
    probe: Option<Arc<dyn EndpointProbe>>,
    cache: Option<Arc<dyn SharedCache>>,
    map: Option<InvalidationMap>,
    network: Option<NetworkMonitor>,
    backoff: Option<Backoff>,
    #[cfg(feature = "auth")]
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ConnectionManagerBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// HTTP client used for the configured stream and probe.
    pub fn http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn EndpointProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn invalidation_map(mut self, map: InvalidationMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = Some(network);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    #[cfg(feature = "auth")]
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    fn requester(&self, client: Client) -> HttpRequester {
        let requester = HttpRequester::new(client);
        #[cfg(feature = "auth")]
        let requester = match &self.token_provider {
            Some(provider) => requester.with_token_provider(Arc::clone(provider)),
            None => requester,
        };
        requester
    }

    pub fn build(mut self) -> SyncResult<ConnectionManager> {
        let cache = self
            .cache
            .take()
            .ok_or(SyncError::MissingComponent("cache"))?;
        let config = self.config.take();
        let client = self.client.take().unwrap_or_default();
        let requester = self.requester(client.clone());

        let transport: Arc<dyn PushTransport> = match (self.transport.take(), &config) {
            (Some(transport), _) => transport,
            (None, Some(config)) => Arc::new(
                HttpSseTransport::new(client.clone(), config.stream_url())
                    .with_requester(requester.clone()),
            ),
            (None, None) => return Err(SyncError::MissingComponent("transport")),
        };

        let probe: Arc<dyn EndpointProbe> = match (self.probe.take(), &config) {
            (Some(probe), _) => probe,
            (None, Some(config)) if config.probe_enabled => Arc::new(
                OpenApiProbe::new(client, config.discovery_url(), config.stream_path.clone())
                    .with_timeout(config.probe_timeout())
                    .with_requester(requester),
            ),
            (None, _) => Arc::new(AlwaysAvailable),
        };

        let backoff = self
            .backoff
            .or_else(|| config.as_ref().map(SyncConfig::backoff))
            .unwrap_or_default();
        let map = self.map.take().unwrap_or_default();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState {
                    epoch: 0,
                    task: None,
                    status: ConnectionStatus::Disconnected,
                    reconnect_attempt: 0,
                    pending_reconnect: None,
                    probe: ProbeState::Pending,
                }),
                status_tx,
                router: InvalidationRouter::new(map, cache),
                transport,
                probe,
                network: self.network.take().unwrap_or_default(),
                backoff,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::transport::ChannelTransport;
    use crate::sse::types::QueryKey;

    struct NullCache;

    impl SharedCache for NullCache {
        fn invalidate(&self, _key: &QueryKey) {}
    }

    #[test]
    fn test_build_requires_cache() {
        let err = ConnectionManager::builder()
            .transport(Arc::new(ChannelTransport::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingComponent("cache")));
    }

    #[test]
    fn test_build_requires_transport_or_config() {
        let err = ConnectionManager::builder()
            .cache(Arc::new(NullCache))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingComponent("transport")));
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let manager = ConnectionManager::builder()
            .config(SyncConfig::default())
            .cache(Arc::new(NullCache))
            .build()
            .unwrap();
        assert_eq!(manager.snapshot(), ConnectionSnapshot::default());
        assert!(manager.invalidation_map().contains("comment.added"));
        assert!(!manager.is_disabled());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let manager = ConnectionManager::builder()
            .transport(Arc::new(ChannelTransport::new()))
            .cache(Arc::new(NullCache))
            .build()
            .unwrap();
        manager.stop();
        manager.stop();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
