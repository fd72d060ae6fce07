//! C7's data model: the session state variant (spec §3, §4.7).
//!
//! A tagged union with per-case immutable payloads, replacing the
//! class hierarchy the Java source uses — this avoids fields that are
//! only meaningful in specific states ever existing as nullable
//! fields on a shared object (spec §9 "Design notes").

use std::sync::Arc;

use crate::error::CloseCause;
use crate::filter::KafkaFilter;
use crate::haproxy::HaProxyPreamble;
use crate::net_filter::HostPort;

/// Client metadata learned from an `ApiVersions` request, carried
/// through `ApiVersions`/`SelectingServer`.
#[derive(Debug, Clone, Default)]
pub struct ClientSoftware {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// The net-filter's decision, carried through `Connecting`/`Forwarding`.
#[derive(Clone)]
pub struct Route {
    pub remote: HostPort,
    pub filters: Vec<Arc<dyn KafkaFilter>>,
    pub virtual_cluster: String,
}

pub enum SessionState {
    /// Initial sentinel, nothing known.
    Startup,
    /// Downstream TCP is up; nothing read yet.
    ClientActive,
    /// A PROXY-protocol preamble has been received and remembered.
    HaProxy { preamble: HaProxyPreamble },
    /// An `ApiVersions` request has been seen and the connection is
    /// configured for SASL authentication offload.
    ApiVersions {
        client_software: ClientSoftware,
        preamble: Option<HaProxyPreamble>,
    },
    /// A non-`ApiVersions` KRPC request has been received; awaiting
    /// the net-filter's choice of upstream.
    SelectingServer {
        client_software: ClientSoftware,
        preamble: Option<HaProxyPreamble>,
    },
    /// An upstream TCP connect is in progress.
    Connecting { route: Route },
    /// Both halves active; frames flow through the filter chain.
    Forwarding { route: Route },
    /// Shutdown initiated; waits for both halves to acknowledge close.
    Closing {
        cause: Option<CloseCause>,
        client_done: bool,
        server_done: bool,
    },
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Short tag for logs/metrics (spec §6 "state-transition counts").
    pub fn tag(&self) -> &'static str {
        match self {
            SessionState::Startup => "startup",
            SessionState::ClientActive => "client_active",
            SessionState::HaProxy { .. } => "ha_proxy",
            SessionState::ApiVersions { .. } => "api_versions",
            SessionState::SelectingServer { .. } => "selecting_server",
            SessionState::Connecting { .. } => "connecting",
            SessionState::Forwarding { .. } => "forwarding",
            SessionState::Closing { .. } => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Invariant 3 (spec §3): the upstream handler reference is
    /// non-null from `Connecting` onward.
    pub fn has_backend(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting { .. }
                | SessionState::Forwarding { .. }
                | SessionState::Closing { .. }
                | SessionState::Closed
        )
    }

    pub fn is_forwarding(&self) -> bool {
        matches!(self, SessionState::Forwarding { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    pub fn route(&self) -> Option<&Route> {
        match self {
            SessionState::Connecting { route } | SessionState::Forwarding { route } => Some(route),
            _ => None,
        }
    }
}
