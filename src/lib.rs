//! # Realtime Sync Kit
//!
//! Keeps a keyed query cache fresh from a single Server-Sent Events stream.
//! Each inbound event names what changed on the server; the kit maps that name
//! to the cache partitions ("query keys") that are now stale and tells the
//! cache to invalidate them, so subscribed views refetch in the background.
//!
//! ## Core Features
//!
//! - **`ConnectionManager`**: one push connection per session, with exponential
//!   reconnect backoff, offline/online handling and an observable status.
//! - **Endpoint probing**: an injectable `EndpointProbe` (OpenAPI lookup by
//!   default) that disables the session when the backend has no push endpoint.
//! - **`InvalidationRouter`**: a static event-type to query-key map with a
//!   fallback partition, so every event has an effect.
//! - **Pluggable cache**: implement `SharedCache` for your own cache, or use the
//!   bundled `QueryCache`.
//! - **Request Coalescing (Optional)**: refetches of one partition are de-duplicated.
//! - **Authentication (Optional)**: bearer tokens from a `TokenProvider`.
//!
//! ## Getting Started
//!
//! See the `sse` module documentation for a full example.
//!
//! ---

pub mod cache;
pub mod config;
pub mod error;
pub mod sse;

#[cfg(feature = "coalescing")]
pub mod coalescing;

#[cfg(feature = "coalescing")]
pub mod query_cache;

#[cfg(feature = "auth")]
pub mod auth;

/// Public prelude for convenience.
///
/// `use realtime_sync_kit::prelude::*;`
pub mod prelude {
    pub use crate::cache::SharedCache;
    pub use crate::config::SyncConfig;
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::sse::{
        backoff::Backoff,
        network::NetworkMonitor,
        probe::{AlwaysAvailable, EndpointProbe, OpenApiProbe, ProbeOutcome},
        router::{InvalidationMap, InvalidationRouter},
        service::{ConnectionManager, ConnectionManagerBuilder, SessionGuard},
        transport::{ChannelTransport, HttpSseTransport, PushTransport, TransportEvent},
        types::{ConnectionSnapshot, ConnectionStatus, EventEnvelope, QueryKey},
    };

    #[cfg(feature = "coalescing")]
    pub use crate::{coalescing::CoalescingService, query_cache::QueryCache};

    #[cfg(feature = "auth")]
    pub use crate::auth::{StaticToken, TokenProvider};
}
