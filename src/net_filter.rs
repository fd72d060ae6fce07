//! C9 — the net-filter (server selector) contract (spec §4.7 "Net
//! filter invocation", §6 "Net-filter interface").
//!
//! Given early client metadata, an external net-filter chooses the
//! upstream broker address and the ordered filter chain for this
//! connection. Grounded in the role `connection_pool.rs`/
//! `proxy_state.rs`'s broker-selection bookkeeping plays in the
//! teacher, generalized from "pick a bore remote port for a broker"
//! to "pick an upstream host and an ordered filter list".

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::filter::KafkaFilter;

/// A resolved upstream broker address.
#[derive(Debug, Clone)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The net-filter's decision: where to connect and which filters are
/// active for this connection (spec §4.7 `onNetFilterInitiateConnect`).
pub struct NetFilterDecision {
    pub remote: HostPort,
    pub filters: Vec<Arc<dyn KafkaFilter>>,
    pub virtual_cluster: String,
}

/// Read-only client metadata available by the time `SelectingServer`
/// is entered, plus the single terminal `initiate_connect` method
/// (spec §6: "exactly one terminal method `initiateConnect`").
pub struct NetFilterContext {
    pub client_software_name: Option<String>,
    pub client_software_version: Option<String>,
    pub ha_proxy_source: Option<(IpAddr, u16)>,
    decision: Mutex<Option<oneshot::Sender<NetFilterDecision>>>,
}

impl NetFilterContext {
    pub fn new(
        client_software_name: Option<String>,
        client_software_version: Option<String>,
        ha_proxy_source: Option<(IpAddr, u16)>,
    ) -> (Arc<Self>, oneshot::Receiver<NetFilterDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(NetFilterContext {
                client_software_name,
                client_software_version,
                ha_proxy_source,
                decision: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Calling this more than once (or, by construction, from a
    /// different connection's context — each connection gets its own
    /// `NetFilterContext`) is a protocol violation that closes the
    /// connection (spec §4.7).
    pub fn initiate_connect(
        &self,
        remote: HostPort,
        filters: Vec<Arc<dyn KafkaFilter>>,
        virtual_cluster: impl Into<String>,
    ) -> Result<(), ProxyError> {
        let mut guard = self.decision.lock().expect("net filter context mutex poisoned");
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(NetFilterDecision {
                    remote,
                    filters,
                    virtual_cluster: virtual_cluster.into(),
                });
                Ok(())
            }
            None => Err(ProxyError::ProtocolViolation(
                "initiateConnect called more than once on the same connection".into(),
            )),
        }
    }
}

#[async_trait]
pub trait NetFilter: Send + Sync {
    async fn select_server(&self, context: Arc<NetFilterContext>);
}

/// The degenerate but fully real net-filter: every connection is
/// routed to the same configured upstream with the same filter chain.
/// Exercises C9 end to end without requiring an external policy
/// service (spec §9 lists no concrete net-filter as in-scope; this one
/// plays the role the teacher's single always-on `KafkaProxy::to`
/// upstream plays there).
pub struct StaticNetFilter {
    remote: HostPort,
    filters: Vec<Arc<dyn KafkaFilter>>,
    virtual_cluster: String,
}

impl StaticNetFilter {
    pub fn new(
        remote: HostPort,
        filters: Vec<Arc<dyn KafkaFilter>>,
        virtual_cluster: impl Into<String>,
    ) -> Self {
        StaticNetFilter {
            remote,
            filters,
            virtual_cluster: virtual_cluster.into(),
        }
    }
}

#[async_trait]
impl NetFilter for StaticNetFilter {
    async fn select_server(&self, context: Arc<NetFilterContext>) {
        // `initiate_connect`'s only failure mode is "called twice",
        // which cannot happen here since each connection owns its own
        // `NetFilterContext` and this filter calls it exactly once.
        let _ = context.initiate_connect(
            self.remote.clone(),
            self.filters.clone(),
            self.virtual_cluster.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_initiate_connect_is_rejected() {
        let (ctx, rx) = NetFilterContext::new(None, None, None);
        assert!(ctx
            .initiate_connect(HostPort::new("broker", 9092), vec![], "default")
            .is_ok());
        assert!(ctx
            .initiate_connect(HostPort::new("broker", 9092), vec![], "default")
            .is_err());
        let decision = rx.await.unwrap();
        assert_eq!(decision.remote.port, 9092);
    }
}
