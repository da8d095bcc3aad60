//! Connects to a chantier backend's push stream and keeps two partitions fresh.
//!
//! ```sh
//! REALTIME_BASE_URL=http://localhost:8000 cargo run --example watch_stream
//! ```

use anyhow::Context;
use realtime_sync_kit::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watch_stream=info,realtime_sync_kit=info".into()),
        )
        .init();

    let config = SyncConfig::from_env()?;
    let http = reqwest::Client::new();
    let cache = Arc::new(QueryCache::new());

    for (key, path) in [("notifications", "/api/notifications"), ("feed", "/api/posts")] {
        let http = http.clone();
        let url = format!("{}{}", config.base_url.trim_end_matches('/'), path);
        cache.register([key], move || {
            let request = http.get(url.clone());
            async move {
                let value = request
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Value>()
                    .await?;
                Ok::<_, anyhow::Error>(value)
            }
        });
    }

    let mut watchers = Vec::new();
    for key in [QueryKey::from(["notifications"]), QueryKey::from(["feed"])] {
        let mut updates = cache
            .subscribe(&key)
            .with_context(|| format!("{key} is not registered"))?;
        watchers.push(tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                info!(%key, fetches = state.fetches, stale = state.stale, error = ?state.error, "Partition updated");
            }
        }));
    }

    let manager = ConnectionManager::builder()
        .config(config)
        .http_client(http)
        .cache(cache.clone())
        .build()?;

    let session = manager.session();
    let mut status = manager.watch_status();
    let reporter = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(%current, "Push connection status");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!(events = manager.events_received(), "Shutting down");
    drop(session);

    reporter.abort();
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}
