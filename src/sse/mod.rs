//! Server-push connection management and event routing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use realtime_sync_kit::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), SyncError> {
//! let cache = Arc::new(QueryCache::new());
//! cache.register(["planning"], || async { Ok(serde_json::json!([])) });
//!
//! let manager = ConnectionManager::builder()
//!     .config(SyncConfig::default())
//!     .cache(cache.clone())
//!     .build()?;
//!
//! // Connect for as long as the guard lives.
//! let _session = manager.session();
//! let mut status = manager.watch_status();
//! status.wait_for(|s| *s == ConnectionStatus::Connected).await.ok();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod decoder;
pub mod network;
pub mod probe;
pub mod router;
pub mod service;
pub mod transport;
pub mod types;
