//! C4 — the correlation map (spec §4.3).
//!
//! Tracks in-flight request correlation ids so responses can be routed
//! to the correct response-filter pipeline (external entries) or to an
//! internal promise held by a filter that issued its own request
//! (internal entries). Grounded in the teacher's
//! `inflight: Arc<DashMap<i32, RequestKeyAndVersion>>` in `kafka.rs`,
//! generalized to carry the extra recipient/promise data an internal
//! entry needs.

use std::sync::Arc;

use dashmap::DashMap;
use kafka_protocol::messages::ApiKey;
use tokio::sync::oneshot;

use crate::frame::ResponseBody;

/// Whether an in-flight request was forwarded on behalf of the client
/// (`External`) or originated by a filter via
/// `FilterContext::originate_request` (`Internal`).
pub enum EntryKind {
    External,
    Internal {
        recipient: String,
        promise: oneshot::Sender<ResponseBody>,
    },
}

pub struct CorrelationEntry {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub kind: EntryKind,
}

/// Owned exclusively by the upstream handler (spec §9 "ownership"):
/// the map is only ever written from the connection's single event
/// loop task, so a concurrent map is used purely for its ergonomic
/// entry API, not because it is shared across threads.
#[derive(Clone, Default)]
pub struct CorrelationMap {
    inner: Arc<DashMap<i32, CorrelationEntry>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invariant (spec §3.6): at most one live entry per id. Returns
    /// `false` (and does not insert) if an entry already exists for
    /// this correlation id — callers should treat that as a protocol
    /// violation, since the codec is expected to assign fresh ids per
    /// request before this is ever reached in ordinary operation.
    pub fn insert_external(&self, correlation_id: i32, api_key: ApiKey, api_version: i16) -> bool {
        self.try_insert(
            correlation_id,
            CorrelationEntry {
                api_key,
                api_version,
                kind: EntryKind::External,
            },
        )
    }

    pub fn insert_internal(
        &self,
        correlation_id: i32,
        api_key: ApiKey,
        api_version: i16,
        recipient: String,
        promise: oneshot::Sender<ResponseBody>,
    ) -> bool {
        self.try_insert(
            correlation_id,
            CorrelationEntry {
                api_key,
                api_version,
                kind: EntryKind::Internal { recipient, promise },
            },
        )
    }

    fn try_insert(&self, correlation_id: i32, entry: CorrelationEntry) -> bool {
        match self.inner.entry(correlation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                true
            }
        }
    }

    /// Removes and returns the entry for a response's correlation id.
    /// `None` means the broker referenced an id the engine never
    /// issued — a `ProxyError::UnknownCorrelation` condition (spec §7).
    pub fn remove(&self, correlation_id: i32) -> Option<CorrelationEntry> {
        self.inner.remove(&correlation_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drains all remaining entries, failing any internal promises
    /// with a connection-closed error (spec §4.3 "remaining internal
    /// promises are then failed with a connection-closed error", §5
    /// "cancellation").
    pub fn drain_on_close(&self) {
        let ids: Vec<i32> = self.inner.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.remove(&id) {
                if let EntryKind::Internal { promise, .. } = entry.kind {
                    // Drop completes the receiver with a RecvError,
                    // which the filter side surfaces as
                    // connection-closed.
                    drop(promise);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_external_insert_is_rejected() {
        let map = CorrelationMap::new();
        assert!(map.insert_external(7, ApiKey::MetadataKey, 12));
        assert!(!map.insert_external(7, ApiKey::FetchKey, 10));
    }

    #[test]
    fn remove_returns_and_clears_entry() {
        let map = CorrelationMap::new();
        map.insert_external(1, ApiKey::MetadataKey, 12);
        assert!(map.remove(1).is_some());
        assert!(map.remove(1).is_none());
    }

    #[tokio::test]
    async fn drain_on_close_fails_internal_promises() {
        let map = CorrelationMap::new();
        let (tx, rx) = oneshot::channel();
        map.insert_internal(5, ApiKey::MetadataKey, 12, "filter-a".into(), tx);
        map.drain_on_close();
        assert!(rx.await.is_err());
    }
}
