//! Narrow, curated glue over `kafka_protocol`'s generated message
//! types. The engine core (spec §1 "out of scope: the Kafka frame
//! codec ... ApiKey/version decoding") treats most API keys as opaque
//! pass-through; this module lists the handful of request/response
//! types the engine and its reference filters need to actually look
//! inside, grounded in the same per-`ApiKey` `match` style as the
//! teacher's `kafka.rs` (which does this for `MetadataKey` alone) and
//! `other_examples/.../tychedelia-akademie/kafka-client.rs`'s
//! `RequestKind`/`ResponseKind` dispatch.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, ApiVersionsResponse, CreateTopicsRequest, CreateTopicsResponse,
    FetchRequest, FetchResponse, MetadataRequest, MetadataResponse, RequestHeader, RequestKind,
    ResponseHeader, ResponseKind,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};

use crate::error::ProxyError;
use crate::frame::{RequestBody, RequestFrame, ResponseBody, ResponseDestination, ResponseFrame};

/// API keys the engine is able to decode into a structured
/// `RequestKind`/`ResponseKind`. Every other key stays opaque.
pub fn is_known_api_key(api_key: ApiKey) -> bool {
    matches!(
        api_key,
        ApiKey::ApiVersionsKey | ApiKey::MetadataKey | ApiKey::CreateTopicsKey | ApiKey::FetchKey
    )
}

/// Peek the three fields every Kafka request frame carries before its
/// header version can even be determined: api key, api version,
/// correlation id. Mirrors the `peek_bytes` sniffing the teacher's
/// `kafka.rs` already does for responses.
pub fn peek_request_prefix(frame: &[u8]) -> Result<(ApiKey, i16, i32), ProxyError> {
    if frame.len() < 8 {
        return Err(ProxyError::ProtocolViolation(
            "frame shorter than the fixed Kafka request prefix".into(),
        ));
    }
    let api_key_raw = i16::from_be_bytes([frame[0], frame[1]]);
    let api_version = i16::from_be_bytes([frame[2], frame[3]]);
    let correlation_id = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let api_key = ApiKey::try_from(api_key_raw)
        .map_err(|_| ProxyError::ProtocolViolation(format!("unknown api key {api_key_raw}")))?;
    Ok((api_key, api_version, correlation_id))
}

fn request_header_version(api_key: ApiKey, api_version: i16) -> i16 {
    match api_key {
        ApiKey::ApiVersionsKey => ApiVersionsRequest::header_version(api_version),
        ApiKey::MetadataKey => MetadataRequest::header_version(api_version),
        ApiKey::CreateTopicsKey => CreateTopicsRequest::header_version(api_version),
        ApiKey::FetchKey => FetchRequest::header_version(api_version),
        // Conservative default for opaque pass-through frames: modern
        // brokers only care about this to decide whether tagged
        // fields follow, and we never inspect the body of an opaque
        // frame, so the exact value only matters if a later filter
        // asks us to decode it (at which point `is_known_api_key`
        // will have already said no and this branch is unreachable).
        _ => 1,
    }
}

/// Fully decodes a request frame's header and (if the api key is
/// known) its body from the raw bytes following the 4-byte length
/// prefix. Used eagerly for `ApiVersions` (the handshake depends on
/// its contents) and on-demand by the filter pipeline for any other
/// known api key a filter's `shouldDeserialize` accepted.
pub fn decode_request(mut bytes: Bytes) -> Result<RequestFrame, ProxyError> {
    let wire_len = bytes.len();
    let (api_key, api_version, _correlation_id) = peek_request_prefix(&bytes)?;
    let header_version = request_header_version(api_key, api_version);
    let header = RequestHeader::decode(&mut bytes, header_version)?;
    let correlation_id = header.correlation_id;

    let body = if is_known_api_key(api_key) {
        RequestBody::Decoded(decode_request_kind(api_key, &mut bytes, api_version)?)
    } else {
        RequestBody::Opaque(bytes)
    };

    Ok(RequestFrame {
        api_key,
        api_version,
        correlation_id,
        header_version,
        header,
        body,
        wire_len,
    })
}

/// Builds an opaque pass-through request frame without decoding the
/// header at all, for the common case where no filter is configured
/// to look at this `(api_key, api_version)`. The raw bytes (header +
/// body, everything after the length prefix) are kept verbatim so
/// re-encoding is a straight copy.
pub fn opaque_request_frame(raw: Bytes) -> Result<RequestFrame, ProxyError> {
    let (api_key, api_version, correlation_id) = peek_request_prefix(&raw)?;
    let wire_len = raw.len();
    Ok(RequestFrame {
        api_key,
        api_version,
        correlation_id,
        header_version: request_header_version(api_key, api_version),
        header: RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id),
        body: RequestBody::Opaque(raw),
        wire_len,
    })
}

/// Promotes an opaque request frame to a decoded one, for the case a
/// filter's `shouldDeserialize` accepted an api key the codec left
/// opaque.
pub fn ensure_decoded_request(frame: &mut RequestFrame) -> Result<(), ProxyError> {
    if frame.is_decoded() {
        return Ok(());
    }
    let RequestBody::Opaque(raw) = &frame.body else {
        return Ok(());
    };
    let mut bytes = raw.clone();
    let header = RequestHeader::decode(&mut bytes, frame.header_version)?;
    frame.header = header;
    frame.body = RequestBody::Decoded(decode_request_kind(
        frame.api_key,
        &mut bytes,
        frame.api_version,
    )?);
    Ok(())
}

fn decode_request_kind(
    api_key: ApiKey,
    bytes: &mut Bytes,
    version: i16,
) -> Result<RequestKind, ProxyError> {
    Ok(match api_key {
        ApiKey::ApiVersionsKey => RequestKind::ApiVersions(ApiVersionsRequest::decode(bytes, version)?),
        ApiKey::MetadataKey => RequestKind::Metadata(MetadataRequest::decode(bytes, version)?),
        ApiKey::CreateTopicsKey => {
            RequestKind::CreateTopics(CreateTopicsRequest::decode(bytes, version)?)
        }
        ApiKey::FetchKey => RequestKind::Fetch(FetchRequest::decode(bytes, version)?),
        other => {
            return Err(ProxyError::ProtocolViolation(format!(
                "no decoder registered for api key {other:?}"
            )))
        }
    })
}

/// Encodes a (possibly filter-mutated) request frame back to the
/// on-wire length-prefixed form for forwarding to the broker.
pub fn encode_request(frame: &RequestFrame, dst: &mut BytesMut) -> Result<(), ProxyError> {
    match &frame.body {
        RequestBody::Opaque(raw) => {
            dst.put_u32(raw.len() as u32);
            dst.put_slice(raw);
        }
        RequestBody::Decoded(kind) => {
            let mut body = BytesMut::new();
            frame.header.encode(&mut body, frame.header_version)?;
            encode_request_kind(kind, &mut body, frame.api_version)?;
            dst.put_u32(body.len() as u32);
            dst.put_slice(&body);
        }
    }
    Ok(())
}

fn encode_request_kind(kind: &RequestKind, dst: &mut BytesMut, version: i16) -> Result<(), ProxyError> {
    match kind {
        RequestKind::ApiVersions(req) => req.encode(dst, version)?,
        RequestKind::Metadata(req) => req.encode(dst, version)?,
        RequestKind::CreateTopics(req) => req.encode(dst, version)?,
        RequestKind::Fetch(req) => req.encode(dst, version)?,
        _ => {
            return Err(ProxyError::ProtocolViolation(
                "no encoder registered for this request kind".into(),
            ))
        }
    }
    Ok(())
}

/// The response-side counterpart of `request_header_version` — kept as
/// its own table rather than reused from the request side since a
/// given api key's request and response header versions are not
/// guaranteed to track each other (they happen to for the api keys
/// this module knows about today, but callers should not rely on
/// that). Used both for decoding broker responses and for encoding a
/// locally synthesized one (`encode_local_api_versions_response`,
/// `engine::send_short_circuit`).
pub fn response_header_version(api_key: ApiKey, api_version: i16) -> i16 {
    match api_key {
        ApiKey::ApiVersionsKey => ApiVersionsResponse::header_version(api_version),
        ApiKey::MetadataKey => MetadataResponse::header_version(api_version),
        ApiKey::CreateTopicsKey => CreateTopicsResponse::header_version(api_version),
        ApiKey::FetchKey => FetchResponse::header_version(api_version),
        _ => 0,
    }
}

/// Decodes a response frame given the `(api_key, api_version)` learned
/// from the correlation map entry (responses do not carry these on the
/// wire, only the correlation id — exactly the constraint the
/// teacher's `KafkaServerCodec::decode` works around via its
/// `inflight` map).
pub fn decode_response(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    mut bytes: Bytes,
    destination: ResponseDestination,
) -> Result<ResponseFrame, ProxyError> {
    let header_version = response_header_version(api_key, api_version);
    let body = if is_known_api_key(api_key) {
        let header = ResponseHeader::decode(&mut bytes, header_version)?;
        debug_assert_eq!(header.correlation_id, correlation_id);
        ResponseBody::Decoded(decode_response_kind(api_key, &mut bytes, api_version)?)
    } else {
        ResponseBody::Opaque(bytes)
    };
    Ok(ResponseFrame {
        api_key,
        api_version,
        correlation_id,
        header_version,
        header: ResponseHeader::default().with_correlation_id(correlation_id),
        body,
        destination,
    })
}

fn decode_response_kind(
    api_key: ApiKey,
    bytes: &mut Bytes,
    version: i16,
) -> Result<ResponseKind, ProxyError> {
    Ok(match api_key {
        ApiKey::ApiVersionsKey => {
            ResponseKind::ApiVersions(ApiVersionsResponse::decode(bytes, version)?)
        }
        ApiKey::MetadataKey => ResponseKind::Metadata(MetadataResponse::decode(bytes, version)?),
        ApiKey::CreateTopicsKey => {
            ResponseKind::CreateTopics(CreateTopicsResponse::decode(bytes, version)?)
        }
        ApiKey::FetchKey => ResponseKind::Fetch(FetchResponse::decode(bytes, version)?),
        other => {
            return Err(ProxyError::ProtocolViolation(format!(
                "no decoder registered for api key {other:?}"
            )))
        }
    })
}

/// Encodes a response frame back to on-wire length-prefixed bytes, for
/// forwarding to the client.
pub fn encode_response(frame: &ResponseFrame, dst: &mut BytesMut) -> Result<(), ProxyError> {
    match &frame.body {
        ResponseBody::Opaque(raw) => {
            let mut body = BytesMut::new();
            frame.header.encode(&mut body, frame.header_version)?;
            body.extend_from_slice(raw);
            dst.put_u32(body.len() as u32);
            dst.put_slice(&body);
        }
        ResponseBody::Decoded(kind) => {
            let mut body = BytesMut::new();
            frame.header.encode(&mut body, frame.header_version)?;
            encode_response_kind(kind, &mut body, frame.api_version)?;
            dst.put_u32(body.len() as u32);
            dst.put_slice(&body);
        }
    }
    Ok(())
}

fn encode_response_kind(
    kind: &ResponseKind,
    dst: &mut BytesMut,
    version: i16,
) -> Result<(), ProxyError> {
    match kind {
        ResponseKind::ApiVersions(resp) => resp.encode(dst, version)?,
        ResponseKind::Metadata(resp) => resp.encode(dst, version)?,
        ResponseKind::CreateTopics(resp) => resp.encode(dst, version)?,
        ResponseKind::Fetch(resp) => resp.encode(dst, version)?,
        _ => {
            return Err(ProxyError::ProtocolViolation(
                "no encoder registered for this response kind".into(),
            ))
        }
    }
    Ok(())
}

/// Builds the `ApiVersions` response the downstream handler answers
/// locally with when SASL offload is enabled (spec §4.4 `inApiVersions`).
/// Lists the API keys this engine actually understands end to end, the
/// way `estuary-flow`'s `dekaf` crate's `Session::api_versions`
/// enumerates its own supported set.
pub fn supported_api_versions() -> ApiVersionsResponse {
    use kafka_protocol::messages::api_versions_response::ApiVersion;

    fn version(api_key: ApiKey, min: i16, max: i16) -> ApiVersion {
        ApiVersion::default()
            .with_api_key(api_key as i16)
            .with_min_version(min)
            .with_max_version(max)
    }

    ApiVersionsResponse::default().with_api_keys(vec![
        version(ApiKey::ApiVersionsKey, 0, ApiVersionsRequest::VERSIONS.max),
        version(ApiKey::MetadataKey, 0, MetadataRequest::VERSIONS.max),
        version(ApiKey::CreateTopicsKey, 0, CreateTopicsRequest::VERSIONS.max),
        version(ApiKey::FetchKey, 0, FetchRequest::VERSIONS.max),
    ])
}

/// Builds a request frame for a filter-originated request (spec §4.3
/// `FilterContext::originate_request`) — there is no wire frame to
/// peek a header version from yet, so it is computed the same way
/// `decode_request` computes it for a client frame.
pub fn build_request_frame(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: RequestKind,
) -> RequestFrame {
    let header_version = request_header_version(api_key, api_version);
    let header = RequestHeader::default()
        .with_request_api_key(api_key as i16)
        .with_request_api_version(api_version)
        .with_correlation_id(correlation_id);
    RequestFrame {
        api_key,
        api_version,
        correlation_id,
        header_version,
        header,
        body: RequestBody::Decoded(body),
        // Never pushed through the pre-forwarding buffer — originated
        // internally by a filter, not read off the client socket.
        wire_len: 0,
    }
}

/// Encodes the local `ApiVersions` response synthesized for SASL
/// offload (spec §4.4 `inApiVersions`) straight to on-wire bytes.
pub fn encode_local_api_versions_response(
    correlation_id: i32,
    api_version: i16,
) -> Result<BytesMut, ProxyError> {
    let header_version = response_header_version(ApiKey::ApiVersionsKey, api_version);
    let header = ResponseHeader::default().with_correlation_id(correlation_id);
    let body = supported_api_versions();

    let mut encoded = BytesMut::new();
    header.encode(&mut encoded, header_version)?;
    body.encode(&mut encoded, api_version)?;

    let mut dst = BytesMut::with_capacity(encoded.len() + 4);
    dst.put_u32(encoded.len() as u32);
    dst.put_slice(&encoded);
    Ok(dst)
}

/// Builds the synthesized Kafka-shaped error response for a correlation
/// id whose in-flight request is being abandoned by `begin_closing`
/// (spec §7). `Ok(None)` means this api key's response carries its
/// error code per-item rather than as a single top-level field, and the
/// original request is no longer available to know which items to
/// populate, so no response can be synthesized — the connection still
/// closes, just without an answer on this correlation id.
pub fn encode_client_visible_error(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    error: ResponseError,
) -> Result<Option<BytesMut>, ProxyError> {
    let body = match api_key {
        ApiKey::ApiVersionsKey => {
            ResponseKind::ApiVersions(ApiVersionsResponse::default().with_error_code(error.code()))
        }
        ApiKey::FetchKey => ResponseKind::Fetch(FetchResponse::default().with_error_code(error.code())),
        ApiKey::MetadataKey | ApiKey::CreateTopicsKey => return Ok(None),
        _ => return Ok(None),
    };

    let header_version = response_header_version(api_key, api_version);
    let header = ResponseHeader::default().with_correlation_id(correlation_id);

    let mut encoded = BytesMut::new();
    header.encode(&mut encoded, header_version)?;
    encode_response_kind(&body, &mut encoded, api_version)?;

    let mut dst = BytesMut::with_capacity(encoded.len() + 4);
    dst.put_u32(encoded.len() as u32);
    dst.put_slice(&encoded);
    Ok(Some(dst))
}

/// Extracts `client_software_name`/`client_software_version` from a
/// decoded `ApiVersionsRequest`, used by the session state machine when
/// entering `ApiVersions`/`SelectingServer`.
pub fn client_software(request: &ApiVersionsRequest) -> (Option<String>, Option<String>) {
    let name = non_empty(&request.client_software_name);
    let version = non_empty(&request.client_software_version);
    (name, version)
}

fn non_empty(s: &StrBytes) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
