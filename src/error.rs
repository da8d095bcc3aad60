//! Error type shared by the transport, router and builder.

use reqwest::StatusCode;

/// Errors produced while syncing. None of them reach UI callers of
/// `ConnectionManager`; they are logged and reflected in the connection status.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The HTTP client failed (connect, TLS, body read).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An inbound `data` field was not a valid JSON envelope.
    #[error("malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The push endpoint answered with a non-success status.
    #[error("push endpoint responded with status {0}")]
    Status(StatusCode),

    /// The push endpoint answered with something other than an event stream.
    #[error("push endpoint returned content type {0:?}, expected text/event-stream")]
    ContentType(String),

    /// A stream line or frame grew past the decoder's limit.
    #[error("push frame exceeds {0} bytes")]
    Oversized(usize),

    /// The server closed the stream.
    #[error("push stream closed by server")]
    Closed,

    /// Raised by in-process transports.
    #[error("transport error: {0}")]
    Transport(String),

    /// An invalidation route broke the map invariants.
    #[error("invalid invalidation mapping: {0}")]
    Mapping(String),

    /// `ConnectionManagerBuilder::build` was missing a component.
    #[error("connection manager is missing its {0}")]
    MissingComponent(&'static str),
}

pub type SyncResult<T> = Result<T, SyncError>;
