//! Error taxonomy for the connection engine (spec §7).
//!
//! Every variant here corresponds to one of the error kinds the
//! engine distinguishes when deciding how to close a connection: bare
//! TCP close, a synthesized Kafka-shaped error response, or a
//! forwarded-but-opaque server exception.

use std::io;

use kafka_protocol::error::ResponseError;
use kafka_protocol::protocol::{DecodeError, EncodeError};
use thiserror::Error;

/// Errors that can terminate a connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// An event was received that is not admissible in the current
    /// session state (e.g. a second PROXY preamble, `initiateConnect`
    /// called twice). Logged at warn, connection closes with no
    /// synthetic response.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The codec signalled a frame larger than the configured
    /// maximum. `was_tls` hints at a likely misconfiguration (a
    /// plaintext client speaking to a TLS-expecting port, or vice
    /// versa) and is surfaced in the warn log.
    #[error("oversized frame (tls={was_tls})")]
    OversizedFrame { was_tls: bool },

    /// Any other exception surfaced from the downstream (client-side)
    /// stack.
    #[error("client exception: {0}")]
    ClientException(#[source] io::Error),

    /// An exception from the upstream (broker-side) stack. The cause
    /// is not forwarded verbatim to the client (the client should not
    /// learn broker-internal detail).
    #[error("server exception: {0}")]
    ServerException(#[source] io::Error),

    /// The broker returned a correlation id that has no entry in the
    /// correlation map. Treated identically to `ServerException`.
    #[error("unknown correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: i32 },

    /// A filter's `apply` returned an error (panicked futures are not
    /// caught; this is for `apply` returning `Err`).
    #[error("filter {filter_name} failed: {source}")]
    FilterError {
        filter_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("frame decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("frame encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Whether this error may be answered with a synthesized Kafka
    /// error response to the client, per spec §7: only possible once
    /// `Forwarding` has been reached and correlation ids are known.
    pub fn client_visible_kafka_error(&self) -> Option<ResponseError> {
        match self {
            ProxyError::OversizedFrame { .. } => Some(ResponseError::InvalidRequest),
            ProxyError::ClientException(_) => Some(ResponseError::UnknownServerError),
            ProxyError::ServerException(_) => Some(ResponseError::UnknownServerError),
            ProxyError::UnknownCorrelation { .. } => Some(ResponseError::UnknownServerError),
            ProxyError::FilterError { .. } => Some(ResponseError::UnknownServerError),
            ProxyError::ProtocolViolation(_) => None,
            ProxyError::Decode(_) | ProxyError::Encode(_) | ProxyError::Io(_) => None,
        }
    }
}

/// The reason a connection transitioned into `Closing`, carried
/// alongside the final state so both halves can be shut down
/// consistently (spec §3 `Closing { cause?, clientDone, serverDone }`).
#[derive(Debug)]
pub struct CloseCause {
    pub error: Option<ProxyError>,
    /// Correlation id a synthesized error response should be sent
    /// under, if any (only set once `Forwarding` was reached and a
    /// specific in-flight request is implicated).
    pub correlation_id: Option<i32>,
}

impl CloseCause {
    pub fn clean() -> Self {
        CloseCause {
            error: None,
            correlation_id: None,
        }
    }

    pub fn from_error(error: ProxyError) -> Self {
        CloseCause {
            error: Some(error),
            correlation_id: None,
        }
    }

    pub fn from_error_with_correlation(error: ProxyError, correlation_id: i32) -> Self {
        CloseCause {
            error: Some(error),
            correlation_id: Some(correlation_id),
        }
    }
}
