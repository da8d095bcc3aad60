// realtime-sync-kit/src/sse/types.rs

//! Value types shared by the connection manager, the router and the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SyncResult;

/// A unique identifier for a single push-transport connection.
pub type ConnectionId = Uuid;

/// Identifies one partition of cached server data, e.g. `["pointages", "feuilles-heures"]`.
///
/// This is the unit of invalidation. Keys are compared segment by segment, and
/// a key "matches" every longer key it is a prefix of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` is a leading slice of this key (every key starts with itself).
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for QueryKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl From<Vec<String>> for QueryKey {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

/// Health of the push connection, as shown by UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// A read-only copy of the manager's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    /// Reset to 0 on a successful open, incremented each time a reconnect is scheduled.
    pub reconnect_attempt: u32,
    /// Successfully decoded inbound events since the manager was built.
    pub events_received: u64,
    /// Delay of the reconnect currently waiting to fire, if any.
    pub pending_reconnect: Option<Duration>,
}

/// One decoded inbound message.
///
/// Servers spell the discriminant `type`, `eventType` or `event_type`, and the
/// payload `payload` or `data`; the first spelling holding a usable value wins.
/// Any valid JSON is accepted. When no spelling holds a string, or the document
/// is not an object, `event_type` stays empty and the router falls back. The payload is carried but never
/// interpreted by the router.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub payload: Value,
}

const TYPE_FIELDS: [&str; 3] = ["type", "eventType", "event_type"];
const PAYLOAD_FIELDS: [&str; 2] = ["payload", "data"];

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            payload: Value::Null,
        }
    }

    /// Parses the `data` field of a push frame. Only invalid JSON is an error.
    pub fn decode(data: &str) -> SyncResult<Self> {
        let document: Value = serde_json::from_str(data)?;
        Ok(Self::from_value(document))
    }

    /// Reads an envelope out of any JSON document.
    pub fn from_value(document: Value) -> Self {
        let Value::Object(mut fields) = document else {
            return Self {
                event_type: None,
                payload: document,
            };
        };
        let event_type = TYPE_FIELDS
            .iter()
            .find_map(|name| fields.get(*name).and_then(Value::as_str))
            .map(str::to_owned);
        let payload = PAYLOAD_FIELDS
            .iter()
            .find_map(|name| fields.remove(*name))
            .unwrap_or_default();
        Self {
            event_type,
            payload,
        }
    }

    /// The discriminant, with empty strings treated as missing.
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref().filter(|t| !t.is_empty())
    }
}

impl<'de> Deserialize<'de> for EventEnvelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_prefix_matching() {
        let sheets = QueryKey::from(["pointages", "feuilles-heures"]);
        assert!(sheets.starts_with(&QueryKey::from(["pointages"])));
        assert!(sheets.starts_with(&sheets));
        assert!(!QueryKey::from(["pointages"]).starts_with(&sheets));
        assert!(!sheets.starts_with(&QueryKey::from(["planning"])));
        assert_eq!(sheets.to_string(), "pointages/feuilles-heures");
    }

    #[test]
    fn test_envelope_accepts_discriminant_aliases() {
        for body in [
            r#"{"type":"comment.added","payload":{"id":1}}"#,
            r#"{"eventType":"comment.added","data":{"id":1}}"#,
            r#"{"event_type":"comment.added","payload":{"id":1}}"#,
        ] {
            let envelope = EventEnvelope::decode(body).unwrap();
            assert_eq!(envelope.event_type(), Some("comment.added"));
            assert_eq!(envelope.payload, json!({"id": 1}));
        }
    }

    #[test]
    fn test_envelope_without_type_decodes() {
        let envelope = EventEnvelope::decode(r#"{"payload":null}"#).unwrap();
        assert_eq!(envelope.event_type(), None);

        let empty = EventEnvelope::decode(r#"{"type":""}"#).unwrap();
        assert_eq!(empty.event_type(), None);
    }

    #[test]
    fn test_envelope_tolerates_odd_shapes() {
        let both = EventEnvelope::decode(
            r#"{"type":"comment.added","eventType":"post.created","payload":{"a":1},"data":{"b":2}}"#,
        )
        .unwrap();
        assert_eq!(both.event_type(), Some("comment.added"));
        assert_eq!(both.payload, json!({"a": 1}));

        // A non-string `type` does not hide a usable alias.
        let numeric = EventEnvelope::decode(r#"{"type":7,"event_type":"meteo.alert"}"#).unwrap();
        assert_eq!(numeric.event_type(), Some("meteo.alert"));

        let scalar = EventEnvelope::decode("42").unwrap();
        assert_eq!(scalar.event_type(), None);
        assert_eq!(scalar.payload, json!(42));
    }

    #[test]
    fn test_envelope_rejects_invalid_json() {
        assert!(EventEnvelope::decode("ping").is_err());
        assert!(EventEnvelope::decode(r#"{"type":"x""#).is_err());
        assert!(EventEnvelope::decode("").is_err());
    }

    #[test]
    fn test_envelope_deserializes_through_serde() {
        let envelope: EventEnvelope =
            serde_json::from_value(json!({"eventType": "post.updated", "data": [1]})).unwrap();
        assert_eq!(envelope.event_type(), Some("post.updated"));
        assert_eq!(envelope.payload, json!([1]));
    }
}
