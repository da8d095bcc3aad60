//! Bearer-token injection for the discovery probe and the push stream.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use realtime_sync_kit::auth::{StaticToken, TokenProvider};
//! # use realtime_sync_kit::prelude::*;
//! # use std::sync::Arc;
//! #
//! // A session store that may or may not hold a token.
//! struct Session {
//!     token: std::sync::RwLock<Option<String>>,
//! }
//!
//! #[async_trait]
//! impl TokenProvider for Session {
//!     async fn bearer_token(&self) -> Option<String> {
//!         self.token.read().ok()?.clone()
//!     }
//! }
//!
//! # struct NoCache;
//! # impl SharedCache for NoCache { fn invalidate(&self, _: &QueryKey) {} }
//! # fn build() -> Result<ConnectionManager, SyncError> {
//! let session = Arc::new(Session { token: std::sync::RwLock::new(Some("abc".into())) });
//! let manager = ConnectionManager::builder()
//!     .config(SyncConfig::default())
//!     .token_provider(session)
//!     .cache(Arc::new(NoCache))
//!     .build()?;
//! # Ok(manager)
//! # }
//! ```

use async_trait::async_trait;
use reqwest::RequestBuilder;
use std::sync::Arc;

/// Supplies the bearer token sent with every probe and stream request.
///
/// The token is asked for on each connection attempt, so a refreshed session
/// token is picked up by the next reconnect.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns the current token, or `None` to send the request unauthenticated.
    async fn bearer_token(&self) -> Option<String>;
}

/// A token fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Attaches `Authorization: Bearer …` when the provider yields a usable token.
pub(crate) async fn authorize(
    request: RequestBuilder,
    provider: Option<&Arc<dyn TokenProvider>>,
) -> RequestBuilder {
    let Some(provider) = provider else {
        return request;
    };
    match provider.bearer_token().await.as_deref().and_then(normalize_token) {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// Strips a stored `Bearer ` prefix; blank tokens count as absent.
fn normalize_token(raw: &str) -> Option<&str> {
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!token.is_empty()).then_some(token)
}
