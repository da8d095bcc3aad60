//! Connection settings, with defaults matching the chantier backend.

use crate::sse::backoff::Backoff;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub stream_path: String,
    pub discovery_path: String,
    /// When false the discovery probe is skipped and the endpoint assumed present.
    pub probe_enabled: bool,
    pub probe_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            stream_path: "/api/notifications/stream".into(),
            discovery_path: "/openapi.json".into(),
            probe_enabled: true,
            probe_timeout_secs: 10,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `REALTIME_*` variables provided by `lookup`,
    /// falling back to the defaults for anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        let probe_enabled = match lookup("REALTIME_PROBE") {
            Some(raw) => raw
                .parse()
                .context("REALTIME_PROBE must be true or false")?,
            None => defaults.probe_enabled,
        };
        let probe_timeout_secs = match lookup("REALTIME_PROBE_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .context("REALTIME_PROBE_TIMEOUT_SECS must be a number")?,
            None => defaults.probe_timeout_secs,
        };
        let backoff_initial_ms = match lookup("REALTIME_BACKOFF_INITIAL_MS") {
            Some(raw) => raw
                .parse()
                .context("REALTIME_BACKOFF_INITIAL_MS must be a number")?,
            None => defaults.backoff_initial_ms,
        };
        let backoff_max_ms = match lookup("REALTIME_BACKOFF_MAX_MS") {
            Some(raw) => raw
                .parse()
                .context("REALTIME_BACKOFF_MAX_MS must be a number")?,
            None => defaults.backoff_max_ms,
        };

        Ok(Self {
            base_url: text("REALTIME_BASE_URL", defaults.base_url),
            stream_path: text("REALTIME_STREAM_PATH", defaults.stream_path),
            discovery_path: text("REALTIME_DISCOVERY_PATH", defaults.discovery_path),
            probe_enabled,
            probe_timeout_secs,
            backoff_initial_ms,
            backoff_max_ms,
        })
    }

    pub fn stream_url(&self) -> String {
        join_url(&self.base_url, &self.stream_path)
    }

    pub fn discovery_url(&self) -> String {
        join_url(&self.base_url, &self.discovery_path)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.stream_url(), "http://localhost:8000/api/notifications/stream");
        assert_eq!(config.discovery_url(), "http://localhost:8000/openapi.json");
        assert_eq!(config.backoff(), Backoff::default());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars = HashMap::from([
            ("REALTIME_BASE_URL", "https://chantier.example.com/"),
            ("REALTIME_STREAM_PATH", "api/events"),
            ("REALTIME_PROBE", "false"),
            ("REALTIME_BACKOFF_INITIAL_MS", "250"),
        ]);
        let config =
            SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.stream_url(), "https://chantier.example.com/api/events");
        assert!(!config.probe_enabled);
        assert_eq!(config.backoff().initial, Duration::from_millis(250));
        assert_eq!(config.backoff().max, Duration::from_millis(30_000));
    }

    #[test]
    fn test_bad_number_is_reported() {
        let err = SyncConfig::from_lookup(|key| {
            (key == "REALTIME_BACKOFF_MAX_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("REALTIME_BACKOFF_MAX_MS"));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"base_url":"http://10.0.0.2:8000","probe_enabled":false}"#)
                .unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2:8000");
        assert!(!config.probe_enabled);
        assert_eq!(config.stream_path, "/api/notifications/stream");
    }
}
