//! C1 — the frame model: tagged representations of decoded/opaque
//! Kafka request and response frames, plus the non-Kafka PROXY-protocol
//! preamble (spec §4.1).

use bytes::Bytes;
use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind};
use tokio::sync::oneshot;

use crate::haproxy::HaProxyPreamble;

/// A decoded-or-opaque request body. Filters that returned
/// `shouldDeserialize == false` for this `(api_key, api_version)` never
/// pay the decode cost; their stage just forwards `Opaque` bytes.
#[derive(Debug)]
pub enum RequestBody {
    Decoded(RequestKind),
    Opaque(Bytes),
}

/// A client-originated (or filter-originated, for `originateRequest`)
/// Kafka request frame, spec §4.1.
#[derive(Debug)]
pub struct RequestFrame {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    /// The Kafka header version this frame's header was decoded
    /// with/should be re-encoded with — `Request::header_version` is
    /// per concrete message type, so the value is captured once at
    /// decode time rather than re-derived from a generic `ApiKey`.
    pub header_version: i16,
    pub header: RequestHeader,
    pub body: RequestBody,
    /// Size in bytes of the frame as read off the wire (header + body,
    /// after the length prefix), captured at decode time so the
    /// pre-forwarding buffer can account real bytes rather than a
    /// per-frame constant. Filter-originated frames built via
    /// `kafka_support::build_request_frame` never pass through that
    /// buffer, so this is `0` for them.
    pub wire_len: usize,
}

impl RequestFrame {
    pub fn is_decoded(&self) -> bool {
        matches!(self.body, RequestBody::Decoded(_))
    }
}

/// A decoded-or-opaque response body, symmetric with `RequestBody`.
#[derive(Debug)]
pub enum ResponseBody {
    Decoded(ResponseKind),
    Opaque(Bytes),
}

/// Identifies who a response is ultimately for. Spec §4.1 / §4.3 /
/// design note: "internal responses are identified by a recipient
/// reference on the response frame ... modelled as a sum type
/// `Response = External | Internal { recipient, promise }` rather than
/// nullable fields."
pub enum ResponseDestination {
    /// Forwarded down to the client as a normal response.
    External,
    /// Delivered to the filter that originated the request via
    /// `FilterContext::originate_request`; never reaches the client.
    Internal {
        recipient: String,
        promise: oneshot::Sender<ResponseBody>,
    },
}

impl std::fmt::Debug for ResponseDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseDestination::External => write!(f, "External"),
            ResponseDestination::Internal { recipient, .. } => {
                write!(f, "Internal(recipient={recipient})")
            }
        }
    }
}

/// A broker-originated Kafka response frame, spec §4.1.
#[derive(Debug)]
pub struct ResponseFrame {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header_version: i16,
    pub header: ResponseHeader,
    pub body: ResponseBody,
    pub destination: ResponseDestination,
}

/// Whatever the downstream codec produces before Kafka framing even
/// begins: either the optional HA-PROXY preamble, or the first (and
/// every subsequent) length-prefixed Kafka request frame.
#[derive(Debug)]
pub enum ClientFrame {
    Preamble(HaProxyPreamble),
    Request(RequestFrame),
}

impl ClientFrame {
    /// Bytes this frame actually occupied on the wire, for the
    /// pre-forwarding buffer's byte accounting (SPEC_FULL.md §4(b)).
    pub fn wire_len(&self) -> usize {
        match self {
            ClientFrame::Preamble(preamble) => preamble.wire_len,
            ClientFrame::Request(frame) => frame.wire_len,
        }
    }
}
