// realtime-sync-kit/src/sse/router.rs

//! Maps inbound event types to the cache partitions they make stale.

use crate::cache::SharedCache;
use crate::error::{SyncError, SyncResult};
use crate::sse::decoder::SseFrame;
use crate::sse::types::{EventEnvelope, QueryKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Routes shipped by [`InvalidationMap::default`].
const DEFAULT_ROUTES: &[(&str, &[&[&str]])] = &[
    ("notification.created", &[&["notifications"]]),
    ("notification.read", &[&["notifications"]]),
    ("comment.added", &[&["notifications"], &["feed"]]),
    ("comment.deleted", &[&["feed"]]),
    ("post.created", &[&["feed"]]),
    ("post.updated", &[&["feed"]]),
    ("post.deleted", &[&["feed"]]),
    ("reaction.added", &[&["feed"]]),
    ("affectation.created", &[&["planning"], &["notifications"]]),
    ("affectation.updated", &[&["planning"]]),
    ("affectation.deleted", &[&["planning"]]),
    ("pointage.created", &[&["pointages"], &["pointages", "feuilles-heures"]]),
    ("pointage.updated", &[&["pointages"], &["pointages", "feuilles-heures"]]),
    ("pointage.validated", &[&["pointages", "feuilles-heures"], &["notifications"]]),
    ("document.uploaded", &[&["documents"]]),
    ("document.deleted", &[&["documents"]]),
    ("reservation.created", &[&["logistique", "reservations"]]),
    ("reservation.updated", &[&["logistique", "reservations"]]),
    ("reservation.validated", &[&["logistique", "reservations"], &["notifications"]]),
    ("reservation.refused", &[&["logistique", "reservations"], &["notifications"]]),
    ("chantier.created", &[&["chantiers"]]),
    ("chantier.updated", &[&["chantiers"], &["planning"]]),
    ("meteo.alert", &[&["meteo"], &["notifications"]]),
];

/// Static mapping from event type to the ordered set of partitions to invalidate.
///
/// Unmapped or missing event types resolve to the fallback set, so every
/// decoded event has at least one observable effect.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationMap {
    routes: HashMap<String, Vec<QueryKey>>,
    fallback: Vec<QueryKey>,
}

impl Default for InvalidationMap {
    fn default() -> Self {
        let routes = DEFAULT_ROUTES
            .iter()
            .map(|(event_type, keys)| {
                let keys = keys.iter().map(|segments| QueryKey::from(*segments));
                ((*event_type).to_owned(), dedup(keys))
            })
            .collect();
        Self {
            routes,
            fallback: vec![QueryKey::from(["notifications"])],
        }
    }
}

impl InvalidationMap {
    /// An empty map whose fallback is `[["notifications"]]`.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: vec![QueryKey::from(["notifications"])],
        }
    }

    /// Adds a route. Fails on an empty event type, a duplicate event type or an
    /// empty partition key.
    pub fn route<I, K>(mut self, event_type: impl Into<String>, keys: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<QueryKey>,
    {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(SyncError::Mapping("event type must not be empty".into()));
        }
        if self.routes.contains_key(&event_type) {
            return Err(SyncError::Mapping(format!("duplicate route for {event_type:?}")));
        }
        let keys = checked_keys(keys)?;
        self.routes.insert(event_type, keys);
        Ok(self)
    }

    /// Replaces the partitions used for unmapped event types.
    pub fn with_fallback<I, K>(mut self, keys: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<QueryKey>,
    {
        self.fallback = checked_keys(keys)?;
        Ok(self)
    }

    pub fn partitions_for(&self, event_type: Option<&str>) -> &[QueryKey] {
        event_type
            .and_then(|t| self.routes.get(t))
            .map(Vec::as_slice)
            .unwrap_or(&self.fallback)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    pub fn fallback(&self) -> &[QueryKey] {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn checked_keys<I, K>(keys: I) -> SyncResult<Vec<QueryKey>>
where
    I: IntoIterator<Item = K>,
    K: Into<QueryKey>,
{
    let keys: Vec<QueryKey> = keys.into_iter().map(Into::into).collect();
    if keys.iter().any(QueryKey::is_empty) {
        return Err(SyncError::Mapping("partition keys must not be empty".into()));
    }
    Ok(dedup(keys))
}

/// Drops repeated keys, keeping first occurrences in order.
fn dedup(keys: impl IntoIterator<Item = QueryKey>) -> Vec<QueryKey> {
    let mut out: Vec<QueryKey> = Vec::new();
    for key in keys {
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

/// Issues the invalidations for each decoded event and counts events.
pub struct InvalidationRouter {
    map: Arc<InvalidationMap>,
    cache: Arc<dyn SharedCache>,
    events_received: AtomicU64,
}

impl fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRouter")
            .field("routes", &self.map.len())
            .field("events_received", &self.events_received())
            .finish()
    }
}

impl InvalidationRouter {
    pub fn new(map: impl Into<Arc<InvalidationMap>>, cache: Arc<dyn SharedCache>) -> Self {
        Self {
            map: map.into(),
            cache,
            events_received: AtomicU64::new(0),
        }
    }

    pub fn map(&self) -> &InvalidationMap {
        &self.map
    }

    /// Invalidates every partition mapped to the envelope's type, once each, and
    /// counts the event. Returns the number of invalidations issued.
    pub fn route(&self, envelope: &EventEnvelope) -> usize {
        let event_type = envelope.event_type();
        let partitions = self.map.partitions_for(event_type);
        for key in partitions {
            self.cache.invalidate(key);
        }
        let total = self.events_received.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            event_type = event_type.unwrap_or("<none>"),
            partitions = partitions.len(),
            events_received = total,
            "Routed push event to invalidations"
        );
        partitions.len()
    }

    /// Decodes a frame's `data` and routes it. A decode failure issues nothing
    /// and leaves the counter untouched.
    ///
    /// When the JSON envelope carries no type, a named SSE `event:` is used instead.
    pub fn handle_frame(&self, frame: &SseFrame) -> SyncResult<usize> {
        let mut envelope = EventEnvelope::decode(&frame.data)?;
        if envelope.event_type().is_none() {
            envelope.event_type = frame.named_event().map(str::to_owned);
        }
        Ok(self.route(&envelope))
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::SeqCst)
    }
}
