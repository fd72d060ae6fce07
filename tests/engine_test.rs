//! End-to-end engine tests driven over real loopback TCP: a test
//! "client" socket on one side, the engine task in the middle, and a
//! test "broker" socket on the other. `engine::run` is concretely typed
//! over `TcpStream` (it needs `into_split`/`set_nodelay`), so loopback
//! sockets stand in for the in-process duplex harness other tests use.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_filter_proxy::config::ProxyConfig;
use kafka_filter_proxy::engine;
use kafka_filter_proxy::filter::{
    DecodedRequest, DecodedResponse, FilterContext, KafkaFilter, RequestFilter, RequestResult,
    ResponseFilter, ResponseResult,
};
use kafka_filter_proxy::filters::topic_prefix::TopicPrefixFilter;
use kafka_filter_proxy::frame::{ResponseBody, ResponseDestination};
use kafka_filter_proxy::kafka_support;
use kafka_filter_proxy::metrics::TracingMetricsSink;
use kafka_filter_proxy::net_filter::{HostPort, StaticNetFilter};
use kafka_protocol::messages::create_topics_request::CreatableTopic;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, CreateTopicsRequest, MetadataRequest, MetadataResponse,
    RequestKind, ResponseHeader, ResponseKind,
};
use kafka_protocol::protocol::{Encodable, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Records its name into a shared log on every `apply`, forwarding
/// everything unchanged — used to observe the actual visitation order
/// of a multi-filter chain on both the request and the response side.
struct OrderTrackingFilter {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl OrderTrackingFilter {
    fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(OrderTrackingFilter { name, log })
    }
}

#[async_trait]
impl RequestFilter for OrderTrackingFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn should_deserialize(&self, api_key: ApiKey, _api_version: i16) -> bool {
        api_key == ApiKey::MetadataKey
    }

    async fn apply(
        &self,
        request: DecodedRequest,
        _context: &dyn FilterContext,
    ) -> anyhow::Result<RequestResult> {
        self.log.lock().unwrap().push(format!("req:{}", self.name));
        Ok(RequestResult::forward(request.header, request.body))
    }
}

#[async_trait]
impl ResponseFilter for OrderTrackingFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn should_deserialize(&self, api_key: ApiKey, _api_version: i16) -> bool {
        api_key == ApiKey::MetadataKey
    }

    async fn apply(
        &self,
        response: DecodedResponse,
        _context: &dyn FilterContext,
    ) -> anyhow::Result<ResponseResult> {
        self.log.lock().unwrap().push(format!("resp:{}", self.name));
        Ok(ResponseResult::forward(response.header, response.body))
    }
}

impl KafkaFilter for OrderTrackingFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn as_request_filter(self: Arc<Self>) -> Option<Arc<dyn RequestFilter>> {
        Some(self)
    }

    fn as_response_filter(self: Arc<Self>) -> Option<Arc<dyn ResponseFilter>> {
        Some(self)
    }
}

fn config(sasl_offload: bool) -> Arc<ProxyConfig> {
    Arc::new(ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_buffered_bytes_before_forwarding: 1024 * 1024,
        max_frame_size_bytes: 100 * 1024 * 1024,
        sasl_authentication_offload: sasl_offload,
        log_network: false,
        log_frames: false,
        tcp_nodelay: true,
        initial_autoread: true,
    })
}

/// Spins up a loopback listener standing in for the broker and returns
/// its address plus the accepted socket once a connection lands.
async fn fake_broker() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, listener)
}

/// Connects a test client to a fresh loopback listener and hands the
/// accepted half to the engine, mirroring what `listener::run` does.
async fn spawn_engine(
    config: Arc<ProxyConfig>,
    filters: Vec<Arc<dyn KafkaFilter>>,
    broker_addr: SocketAddr,
) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();

    let net_filter = Arc::new(StaticNetFilter::new(
        HostPort::new(broker_addr.ip().to_string(), broker_addr.port()),
        filters,
        "default",
    ));
    let metrics = Arc::new(TracingMetricsSink);
    tokio::spawn(engine::run(
        uuid::Uuid::new_v4(),
        accepted,
        config,
        net_filter,
        metrics,
    ));
    client
}

fn opaque_request(api_key: ApiKey, correlation_id: i32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(api_key as i16);
    buf.put_i16(0); // api_version
    buf.put_i32(correlation_id);
    buf.put_slice(body);
    let mut framed = BytesMut::with_capacity(buf.len() + 4);
    framed.put_u32(buf.len() as u32);
    framed.put_slice(&buf);
    framed.freeze()
}

fn opaque_response(correlation_id: i32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(correlation_id);
    buf.put_slice(body);
    let mut framed = BytesMut::with_capacity(buf.len() + 4);
    framed.put_u32(buf.len() as u32);
    framed.put_slice(&buf);
    framed.freeze()
}

async fn read_one_frame(socket: &mut TcpStream) -> Bytes {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await.unwrap();
    Bytes::from(body)
}

#[tokio::test]
async fn happy_path_forwards_opaque_frames_both_ways() {
    let (broker_addr, broker_listener) = fake_broker().await;
    let mut client = spawn_engine(config(false), vec![], broker_addr).await;

    client
        .write_all(&opaque_request(ApiKey::ProduceKey, 7, b"hello broker"))
        .await
        .unwrap();

    let (mut broker_side, _) = timeout(Duration::from_secs(5), broker_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let forwarded = timeout(Duration::from_secs(5), read_one_frame(&mut broker_side))
        .await
        .unwrap();
    // api_key(2) + api_version(2) + correlation_id(4) + "hello broker"
    assert_eq!(&forwarded[8..], b"hello broker");
    let mut correlation_id_bytes = &forwarded[4..8];
    assert_eq!(correlation_id_bytes.get_i32(), 7);

    broker_side
        .write_all(&opaque_response(7, b"hello client"))
        .await
        .unwrap();
    let answer = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();
    assert_eq!(&answer[4..], b"hello client");
}

#[tokio::test]
async fn pipelined_responses_route_back_by_correlation_id_even_out_of_order() {
    let (broker_addr, broker_listener) = fake_broker().await;
    let mut client = spawn_engine(config(false), vec![], broker_addr).await;

    client
        .write_all(&opaque_request(ApiKey::ProduceKey, 1, b"first"))
        .await
        .unwrap();
    client
        .write_all(&opaque_request(ApiKey::ProduceKey, 2, b"second"))
        .await
        .unwrap();

    let (mut broker_side, _) = timeout(Duration::from_secs(5), broker_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let _first_forwarded = timeout(Duration::from_secs(5), read_one_frame(&mut broker_side))
        .await
        .unwrap();
    let _second_forwarded = timeout(Duration::from_secs(5), read_one_frame(&mut broker_side))
        .await
        .unwrap();

    // Broker answers out of order: correlation id 2 before 1.
    broker_side
        .write_all(&opaque_response(2, b"reply-to-second"))
        .await
        .unwrap();
    broker_side
        .write_all(&opaque_response(1, b"reply-to-first"))
        .await
        .unwrap();

    let answer_a = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();
    let answer_b = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();

    let mut correlation_a = &answer_a[0..4];
    let mut correlation_b = &answer_b[0..4];
    assert_eq!(correlation_a.get_i32(), 2);
    assert_eq!(&answer_a[4..], b"reply-to-second");
    assert_eq!(correlation_b.get_i32(), 1);
    assert_eq!(&answer_b[4..], b"reply-to-first");
}

#[tokio::test]
async fn sasl_offload_answers_api_versions_locally() {
    let (broker_addr, _broker_listener) = fake_broker().await;
    let mut client = spawn_engine(config(true), vec![], broker_addr).await;

    let request = kafka_support::build_request_frame(
        ApiKey::ApiVersionsKey,
        0,
        99,
        RequestKind::ApiVersions(ApiVersionsRequest::default()),
    );
    let mut buf = BytesMut::new();
    kafka_support::encode_request(&request, &mut buf).unwrap();
    client.write_all(&buf).await.unwrap();

    let answer = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();
    let frame = kafka_support::decode_response(
        ApiKey::ApiVersionsKey,
        0,
        99,
        answer,
        ResponseDestination::External,
    )
    .unwrap();
    assert_eq!(frame.correlation_id, 99);
    let ResponseBody::Decoded(ResponseKind::ApiVersions(body)) = frame.body else {
        panic!("expected an ApiVersions response");
    };
    assert!(body
        .api_keys
        .iter()
        .any(|k| k.api_key == ApiKey::ApiVersionsKey as i16));
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let (broker_addr, _broker_listener) = fake_broker().await;
    let mut config = (*config(false)).clone();
    config.max_frame_size_bytes = 16;
    let mut client = spawn_engine(Arc::new(config), vec![], broker_addr).await;

    let mut framed = BytesMut::new();
    framed.put_u32(10_000);
    client.write_all(&framed).await.unwrap();

    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "connection should be closed after the oversized frame");
}

#[tokio::test]
async fn short_circuited_create_topics_request_never_reaches_the_broker() {
    // The upstream TCP connect happens as soon as a server is selected,
    // ahead of the filter chain (spec §4.7's handshake order), so the
    // broker side does see a connection land here — what must never
    // happen is the CreateTopics request bytes themselves arriving.
    let (broker_addr, broker_listener) = fake_broker().await;
    let filters: Vec<Arc<dyn KafkaFilter>> = vec![TopicPrefixFilter::new("team-a.")];
    let mut client = spawn_engine(config(false), filters, broker_addr).await;

    let mut topics = IndexMap::new();
    topics.insert(
        StrBytes::from_static_str("unprefixed-topic"),
        CreatableTopic::default(),
    );
    let request = kafka_support::build_request_frame(
        ApiKey::CreateTopicsKey,
        5,
        3,
        RequestKind::CreateTopics(CreateTopicsRequest::default().with_topics(topics)),
    );
    let mut buf = BytesMut::new();
    kafka_support::encode_request(&request, &mut buf).unwrap();
    client.write_all(&buf).await.unwrap();

    let answer = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();
    let frame = kafka_support::decode_response(
        ApiKey::CreateTopicsKey,
        5,
        3,
        answer,
        ResponseDestination::External,
    )
    .unwrap();
    let ResponseBody::Decoded(ResponseKind::CreateTopics(body)) = frame.body else {
        panic!("expected a CreateTopics response");
    };
    let result = body
        .topics
        .get(&StrBytes::from_static_str("unprefixed-topic"))
        .expect("the rejected topic should still get a per-topic result");
    assert_ne!(result.error_code, 0);

    // A connection lands (net-filter selection/connect precede the
    // filter chain), but the short-circuited request is never written
    // to it.
    let (mut broker_side, _) = timeout(Duration::from_secs(5), broker_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut probe = [0u8; 1];
    let result = timeout(Duration::from_millis(200), broker_side.read(&mut probe)).await;
    assert!(result.is_err(), "broker should never receive the rejected request");
}

#[tokio::test]
async fn two_filter_chain_visits_responses_in_reverse_of_requests() {
    let (broker_addr, broker_listener) = fake_broker().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let filters: Vec<Arc<dyn KafkaFilter>> = vec![
        OrderTrackingFilter::new("f1", log.clone()),
        OrderTrackingFilter::new("f2", log.clone()),
    ];
    let mut client = spawn_engine(config(false), filters, broker_addr).await;

    let correlation_id = 42;
    let request = kafka_support::build_request_frame(
        ApiKey::MetadataKey,
        0,
        correlation_id,
        RequestKind::Metadata(MetadataRequest::default()),
    );
    let mut buf = BytesMut::new();
    kafka_support::encode_request(&request, &mut buf).unwrap();
    client.write_all(&buf).await.unwrap();

    let (mut broker_side, _) = timeout(Duration::from_secs(5), broker_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let _forwarded = timeout(Duration::from_secs(5), read_one_frame(&mut broker_side))
        .await
        .unwrap();

    let header_version = kafka_support::response_header_version(ApiKey::MetadataKey, 0);
    let header = ResponseHeader::default().with_correlation_id(correlation_id);
    let body = MetadataResponse::default();
    let mut encoded = BytesMut::new();
    header.encode(&mut encoded, header_version).unwrap();
    body.encode(&mut encoded, 0).unwrap();
    let mut framed = BytesMut::with_capacity(encoded.len() + 4);
    framed.put_u32(encoded.len() as u32);
    framed.put_slice(&encoded);
    broker_side.write_all(&framed).await.unwrap();

    let _answer = timeout(Duration::from_secs(5), read_one_frame(&mut client))
        .await
        .unwrap();

    let observed = log.lock().unwrap().clone();
    assert_eq!(observed, vec!["req:f1", "req:f2", "resp:f2", "resp:f1"]);
}
