//! Ambient: observable side channels (SPEC_FULL.md §3.5). No external
//! metrics backend is wired up (out of scope, spec.md §1), but the
//! seam is real: `MetricsSink` is consulted from the engine at every
//! point spec §6 calls out as an "observable side channel", with a
//! tracing-backed default implementation standing in for a future
//! Prometheus/StatsD sink.

use tracing::info;

pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self, conn_id: &str);
    fn connection_closed(&self, conn_id: &str, cause: &str);
    fn bytes_forwarded(&self, direction: Direction, bytes: usize);
    fn state_transition(&self, conn_id: &str, from: &str, to: &str);
    fn short_circuited(&self, conn_id: &str, api_key: &str);
    fn protocol_error(&self, conn_id: &str, kind: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

/// Default sink: every event becomes a structured `tracing` event
/// rather than a counter in an external system.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn connection_opened(&self, conn_id: &str) {
        info!(%conn_id, "connection opened");
    }

    fn connection_closed(&self, conn_id: &str, cause: &str) {
        info!(%conn_id, %cause, "connection closed");
    }

    fn bytes_forwarded(&self, direction: Direction, bytes: usize) {
        info!(direction = direction.as_str(), bytes, "bytes forwarded");
    }

    fn state_transition(&self, conn_id: &str, from: &str, to: &str) {
        info!(%conn_id, from, to, "state transition");
    }

    fn short_circuited(&self, conn_id: &str, api_key: &str) {
        info!(%conn_id, api_key, "request short-circuited");
    }

    fn protocol_error(&self, conn_id: &str, kind: &str) {
        info!(%conn_id, kind, "protocol error");
    }
}
