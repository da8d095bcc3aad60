// realtime-sync-kit/src/sse/transport.rs

//! Push transports: the HTTP Server-Sent Events client and an in-process channel.

#[cfg(feature = "auth")]
use crate::auth::TokenProvider;
use crate::error::SyncError;
use crate::sse::decoder::{SseDecoder, SseFrame};
use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::Stream;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// What a push connection reports, in delivery order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The server accepted the stream.
    Open,
    /// One complete server-push frame.
    Frame(SseFrame),
    /// The connection failed; nothing further is delivered.
    Error(SyncError),
}

/// The events of a single connection. Dropping it closes the connection;
/// the stream ending is treated like an error.
pub type TransportStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// A source of server-push connections.
pub trait PushTransport: Send + Sync + 'static {
    /// Starts one connection attempt.
    fn open(&self) -> TransportStream;
}

/// Builds GET requests carrying the optional bearer token.
#[derive(Clone)]
pub(crate) struct HttpRequester {
    client: Client,
    #[cfg(feature = "auth")]
    auth: Option<Arc<dyn TokenProvider>>,
}

impl HttpRequester {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            #[cfg(feature = "auth")]
            auth: None,
        }
    }

    #[cfg(feature = "auth")]
    pub(crate) fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub(crate) async fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        #[cfg(feature = "auth")]
        let request = crate::auth::authorize(request, self.auth.as_ref()).await;
        request
    }
}

/// Server-Sent Events over HTTP.
///
/// Remembers the last `id:` the server sent and replays it as `Last-Event-ID`
/// on the next connection so the server can resume the stream.
#[derive(Clone)]
pub struct HttpSseTransport {
    requester: HttpRequester,
    url: String,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for HttpSseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSseTransport")
            .field("url", &self.url)
            .field("last_event_id", &self.last_event_id())
            .finish()
    }
}

impl HttpSseTransport {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            requester: HttpRequester::new(client),
            url: url.into(),
            last_event_id: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(feature = "auth")]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.requester = self.requester.with_token_provider(provider);
        self
    }

    pub(crate) fn with_requester(mut self, requester: HttpRequester) -> Self {
        self.requester = requester;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn last_event_id(&self) -> Option<String> {
        lock(&self.last_event_id).clone()
    }

    fn remember_id(&self, frame: &SseFrame) {
        if let Some(id) = &frame.id {
            *lock(&self.last_event_id) = Some(id.clone());
        }
    }
}

impl PushTransport for HttpSseTransport {
    fn open(&self) -> TransportStream {
        let this = self.clone();
        Box::pin(stream! {
            let mut request = this
                .requester
                .get(&this.url)
                .await
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(id) = this.last_event_id() {
                request = request.header("Last-Event-ID", id);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield TransportEvent::Error(SyncError::from(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                yield TransportEvent::Error(SyncError::Status(status));
                return;
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            if !content_type.starts_with("text/event-stream") {
                yield TransportEvent::Error(SyncError::ContentType(content_type));
                return;
            }

            debug!(url = %this.url, "Push stream accepted by server");
            yield TransportEvent::Open;

            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => match decoder.feed(&bytes) {
                        Ok(frames) => {
                            for frame in frames {
                                this.remember_id(&frame);
                                yield TransportEvent::Frame(frame);
                            }
                        }
                        Err(e) => {
                            yield TransportEvent::Error(e);
                            return;
                        }
                    },
                    Err(e) => {
                        yield TransportEvent::Error(SyncError::from(e));
                        return;
                    }
                }
            }
            yield TransportEvent::Error(SyncError::Closed);
        })
    }
}

/// A transport fed from inside the process.
///
/// Each [`PushTransport::open`] call counts as one connection attempt and
/// replaces the current connection; the `send` helpers target the newest one.
/// Useful to bridge another push source into the manager, and to drive the
/// manager step by step in tests.
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    inner: Arc<Mutex<ChannelState>>,
}

#[derive(Debug, Default)]
struct ChannelState {
    attempts: usize,
    current: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the manager has opened a connection.
    pub fn connection_attempts(&self) -> usize {
        lock(&self.inner).attempts
    }

    /// True while the newest connection's stream is still held by its consumer.
    pub fn is_open(&self) -> bool {
        lock(&self.inner)
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Delivers an event on the newest connection. Returns false when there is
    /// no connection or it has been dropped.
    pub fn send(&self, event: TransportEvent) -> bool {
        match &lock(&self.inner).current {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn accept(&self) -> bool {
        self.send(TransportEvent::Open)
    }

    pub fn push_data(&self, data: impl Into<String>) -> bool {
        self.send(TransportEvent::Frame(SseFrame::message(data)))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.send(TransportEvent::Error(SyncError::Transport(reason.into())))
    }

    /// Ends the newest connection's stream, like a server hanging up.
    pub fn close(&self) -> bool {
        lock(&self.inner).current.take().is_some()
    }
}

impl PushTransport for ChannelTransport {
    fn open(&self) -> TransportStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.inner);
        state.attempts += 1;
        state.current = Some(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
