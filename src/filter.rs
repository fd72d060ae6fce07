//! C2 — the filter contract — and C3 — the filter-result builders
//! (spec §4.2).
//!
//! The Java source the spec distills from gives both filter kinds a
//! single shared result-builder class and enforces "forward may only
//! carry request data in the request builder" etc. at runtime. Rust's
//! type system can make that invariant unrepresentable instead of
//! merely checked: `RequestResult`/`ResponseResult` are distinct enums
//! and `short_circuit` only exists on the request side, so a filter
//! author cannot construct an ill-formed result in the first place.

use async_trait::async_trait;
use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind};

use crate::frame::ResponseBody;

/// Outcome of a request filter's `apply` (spec §4.2).
pub enum RequestResult {
    /// Continue the chain, optionally with a mutated header/body.
    Forward {
        header: RequestHeader,
        body: RequestKind,
    },
    /// Discard the frame; no response is generated, the broker never
    /// sees it.
    Drop,
    /// Answer the client directly without contacting the broker.
    /// `close_after` requests the connection be closed once the
    /// synthesized response has been flushed.
    ShortCircuit {
        header: Option<ResponseHeader>,
        body: ResponseKind,
        close_after: bool,
    },
    /// Terminate the downstream connection immediately.
    Disconnect,
}

impl RequestResult {
    pub fn forward(header: RequestHeader, body: RequestKind) -> Self {
        RequestResult::Forward { header, body }
    }

    pub fn short_circuit(body: ResponseKind) -> Self {
        RequestResult::ShortCircuit {
            header: None,
            body,
            close_after: false,
        }
    }

    pub fn short_circuit_and_close(body: ResponseKind) -> Self {
        RequestResult::ShortCircuit {
            header: None,
            body,
            close_after: true,
        }
    }
}

/// Outcome of a response filter's `apply` (spec §4.2), symmetric with
/// `RequestResult` minus the short-circuit case (that only makes sense
/// request-side: there is nowhere "earlier" to answer a response to).
pub enum ResponseResult {
    Forward {
        header: ResponseHeader,
        body: ResponseKind,
    },
    Drop,
    Disconnect,
}

impl ResponseResult {
    pub fn forward(header: ResponseHeader, body: ResponseKind) -> Self {
        ResponseResult::Forward { header, body }
    }
}

/// A decoded request handed to a filter stage, plus the fields the
/// pipeline needs regardless of mutation.
pub struct DecodedRequest {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header: RequestHeader,
    pub body: RequestKind,
}

pub struct DecodedResponse {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header: ResponseHeader,
    pub body: ResponseKind,
}

/// Per-invocation context exposed to a filter's `apply` (spec §6
/// "Filter interfaces"). `originate_request` lets a filter issue its
/// own request to the broker and await the response without that
/// response ever reaching the client — completed by the correlation
/// map's internal-entry machinery (spec §4.3).
#[async_trait]
pub trait FilterContext: Send + Sync {
    fn correlation_id(&self) -> i32;

    async fn originate_request(
        &self,
        api_key: ApiKey,
        api_version: i16,
        body: RequestKind,
    ) -> anyhow::Result<ResponseBody>;

    fn virtual_cluster(&self) -> &str;
}

/// A request filter: observes/mutates/drops/short-circuits client
/// requests before they reach the broker (spec §4.2).
#[async_trait]
pub trait RequestFilter: Send + Sync {
    /// Stable name used in logs/metrics (`FilterError`'s
    /// `filter_name`, spec §7).
    fn name(&self) -> &str;

    /// Consulted *before* decode so pass-through frames never pay the
    /// decode cost (spec §4.2). Default: never wants a body decoded.
    fn should_deserialize(&self, _api_key: ApiKey, _api_version: i16) -> bool {
        false
    }

    async fn apply(
        &self,
        request: DecodedRequest,
        context: &dyn FilterContext,
    ) -> anyhow::Result<RequestResult>;

    /// Lifecycle hook fired once per connection on `Closed` (spec §5
    /// "Resource release ... filter-owned resources are notified via a
    /// `Closed` lifecycle hook on each filter instance").
    fn on_closed(&self) {}
}

/// A response filter, symmetric with `RequestFilter`.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &str;

    fn should_deserialize(&self, _api_key: ApiKey, _api_version: i16) -> bool {
        false
    }

    async fn apply(
        &self,
        response: DecodedResponse,
        context: &dyn FilterContext,
    ) -> anyhow::Result<ResponseResult>;

    fn on_closed(&self) {}
}

/// A filter chain is a request filter and response filter pair that
/// share identity and lifecycle (most real filters implement both
/// halves of a single concern, e.g. "reject some CreateTopics
/// requests" pairs naturally with "nothing to do on the response
/// side"). The net-filter hands back an ordered `Vec` of these (spec
/// §4.5's "ordered list of filters").
pub trait KafkaFilter: Send + Sync {
    fn name(&self) -> &str;
    fn as_request_filter(self: std::sync::Arc<Self>) -> Option<std::sync::Arc<dyn RequestFilter>>;
    fn as_response_filter(self: std::sync::Arc<Self>)
        -> Option<std::sync::Arc<dyn ResponseFilter>>;
    fn on_closed(&self) {}
}
