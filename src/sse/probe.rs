//! One-time check that the backend implements the push endpoint at all.

use crate::sse::transport::HttpRequester;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    /// The session should never try to connect. Carries the reason for logging.
    Unavailable(String),
}

/// Decides, before the first connection attempt, whether the push endpoint exists.
#[async_trait]
pub trait EndpointProbe: Send + Sync + 'static {
    async fn check(&self) -> ProbeOutcome;
}

/// Skips the round trip and always reports the endpoint as available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

#[async_trait]
impl EndpointProbe for AlwaysAvailable {
    async fn check(&self) -> ProbeOutcome {
        ProbeOutcome::Available
    }
}

/// Looks the stream path up in the backend's OpenAPI document.
///
/// - the request fails outright: unavailable (the backend is unreachable);
/// - non-success status: available (no discovery document to consult);
/// - the document's `paths` lists the stream path: available, otherwise unavailable.
#[derive(Clone)]
pub struct OpenApiProbe {
    requester: HttpRequester,
    discovery_url: String,
    stream_path: String,
    timeout: Option<Duration>,
}

impl fmt::Debug for OpenApiProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenApiProbe")
            .field("discovery_url", &self.discovery_url)
            .field("stream_path", &self.stream_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenApiProbe {
    pub fn new(
        client: Client,
        discovery_url: impl Into<String>,
        stream_path: impl Into<String>,
    ) -> Self {
        Self {
            requester: HttpRequester::new(client),
            discovery_url: discovery_url.into(),
            stream_path: stream_path.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(feature = "auth")]
    pub fn with_token_provider(mut self, provider: std::sync::Arc<dyn crate::auth::TokenProvider>) -> Self {
        self.requester = self.requester.with_token_provider(provider);
        self
    }

    pub(crate) fn with_requester(mut self, requester: HttpRequester) -> Self {
        self.requester = requester;
        self
    }
}

#[async_trait]
impl EndpointProbe for OpenApiProbe {
    #[instrument(skip(self), fields(url = %self.discovery_url, path = %self.stream_path))]
    async fn check(&self) -> ProbeOutcome {
        let mut request = self.requester.get(&self.discovery_url).await;
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return ProbeOutcome::Unavailable(format!("discovery request failed: {e}")),
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "No discovery document, assuming the push endpoint exists");
            return ProbeOutcome::Available;
        }

        match response.json::<Value>().await {
            Ok(document) if advertises(&document, &self.stream_path) => ProbeOutcome::Available,
            Ok(_) => ProbeOutcome::Unavailable(format!(
                "{} is not listed in the discovery document",
                self.stream_path
            )),
            Err(e) => ProbeOutcome::Unavailable(format!("discovery document unreadable: {e}")),
        }
    }
}

fn advertises(document: &Value, path: &str) -> bool {
    document
        .get("paths")
        .and_then(Value::as_object)
        .is_some_and(|paths| paths.contains_key(path))
}
