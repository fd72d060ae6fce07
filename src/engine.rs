//! The connection engine (spec §4.7, §5): one owning task per
//! connection, unifying C5/C6/C8/C9/C4/backpressure behind a single
//! `while let Some(event) = rx.recv().await` loop. No lock is ever
//! taken on connection state — every mutation happens on this one
//! task, reader tasks and background helpers only ever push events in.
//! Grounded in the teacher's `kafka_proxy` connection future
//! (`tokio::select!` joining the two directions of `client.rs`), here
//! generalized from "two always-forwarding halves" to "a state machine
//! gating which half is even active yet".

use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use kafka_protocol::messages::{ApiKey, RequestKind, ResponseHeader, ResponseKind};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backpressure::{Backpressure, ReadGate};
use crate::correlation::{CorrelationMap, EntryKind};
use crate::downstream::{self, DownstreamEvent, DownstreamWriter, FrameBuffer};
use crate::error::{CloseCause, ProxyError};
use crate::filter::{FilterContext, KafkaFilter, RequestFilter, ResponseFilter};
use crate::frame::{
    ClientFrame, RequestFrame, ResponseBody, ResponseDestination, ResponseFrame,
};
use crate::haproxy::HaProxyPreamble;
use crate::kafka_support;
use crate::metrics::{Direction, MetricsSink};
use crate::net_filter::{NetFilter, NetFilterContext, NetFilterDecision};
use crate::pipeline::{self, RequestOutcome, ResponseOutcome};
use crate::state::{ClientSoftware, Route, SessionState};
use crate::upstream::{self, UpstreamEvent, UpstreamWriter};

use crate::config::ProxyConfig;

enum EngineEvent {
    Downstream(DownstreamEvent),
    Upstream(UpstreamEvent),
    ClientWritability(crate::outbound::WritabilityEdge),
    ServerWritability(crate::outbound::WritabilityEdge),
    ServerSelected(NetFilterDecision),
    Connected(TcpStream),
    ConnectFailed(std::io::Error),
    NetFilterFailed,
}

fn relay<T, F>(mut src: mpsc::UnboundedReceiver<T>, dst: mpsc::UnboundedSender<EngineEvent>, wrap: F)
where
    T: Send + 'static,
    F: Fn(T) -> EngineEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = src.recv().await {
            if dst.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}

/// Drives one client connection end to end. Returns once the
/// connection has fully closed.
pub async fn run(
    conn_id: Uuid,
    stream: TcpStream,
    config: Arc<ProxyConfig>,
    net_filter: Arc<dyn NetFilter>,
    metrics: Arc<dyn MetricsSink>,
) {
    let span = info_span!("conn", %conn_id);
    async move {
        downstream::apply_tcp_nodelay(&stream, config.tcp_nodelay);
        let (client_read, client_write) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel::<EngineEvent>();

        let (client_autoread_tx, client_autoread_rx) = watch::channel(config.initial_autoread);
        let (server_autoread_tx, server_autoread_rx) = watch::channel(config.initial_autoread);

        let (down_tx, down_rx) = mpsc::unbounded_channel::<DownstreamEvent>();
        relay(down_rx, tx.clone(), EngineEvent::Downstream);
        downstream::spawn_reader(
            client_read,
            config.max_frame_size_bytes,
            client_autoread_rx,
            down_tx,
        );

        let (client_edge_tx, client_edge_rx) = mpsc::unbounded_channel();
        relay(client_edge_rx, tx.clone(), EngineEvent::ClientWritability);
        let downstream_writer = Arc::new(DownstreamWriter::spawn(client_write, client_edge_tx));

        let pre_forward_buffer = FrameBuffer::new(config.max_buffered_bytes_before_forwarding);
        let mut engine = Engine {
            conn_id,
            config,
            metrics,
            state: SessionState::ClientActive,
            backpressure: Backpressure::new(),
            correlations: CorrelationMap::new(),
            downstream_writer,
            upstream_writer: None,
            pre_forward_buffer,
            next_internal_correlation_id: Arc::new(AtomicI32::new(i32::MAX / 2)),
            client_autoread_tx,
            server_autoread_tx,
            server_autoread_rx: Some(server_autoread_rx),
            net_filter,
            tx: tx.clone(),
        };

        engine.metrics.connection_opened(&engine.conn_id.to_string());
        engine.run_loop(rx).await;
    }
    .instrument(span)
    .await;
}

struct Engine {
    conn_id: Uuid,
    config: Arc<ProxyConfig>,
    metrics: Arc<dyn MetricsSink>,
    state: SessionState,
    backpressure: Backpressure,
    correlations: CorrelationMap,
    downstream_writer: Arc<DownstreamWriter>,
    upstream_writer: Option<Arc<UpstreamWriter>>,
    pre_forward_buffer: FrameBuffer,
    next_internal_correlation_id: Arc<AtomicI32>,
    client_autoread_tx: watch::Sender<bool>,
    server_autoread_tx: watch::Sender<bool>,
    server_autoread_rx: Option<watch::Receiver<bool>>,
    net_filter: Arc<dyn NetFilter>,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    async fn run_loop(&mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            if self.state.is_closed() {
                break;
            }
            if let Err(err) = self.handle_event(event).await {
                self.begin_closing(CloseCause::from_error(err)).await;
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<(), ProxyError> {
        match event {
            EngineEvent::Downstream(DownstreamEvent::Frame(frame)) => {
                self.handle_client_frame(frame).await?
            }
            EngineEvent::Downstream(DownstreamEvent::Closed) => {
                self.begin_closing(CloseCause::clean()).await;
            }
            EngineEvent::Downstream(DownstreamEvent::Error(err)) => {
                self.begin_closing(CloseCause::from_error(err)).await;
            }
            EngineEvent::Upstream(UpstreamEvent::Frame(frame)) => {
                self.handle_server_frame(frame).await?
            }
            EngineEvent::Upstream(UpstreamEvent::Closed) => {
                self.begin_closing(CloseCause::clean()).await;
            }
            EngineEvent::Upstream(UpstreamEvent::Error(err)) => {
                self.begin_closing(CloseCause::from_error(err)).await;
            }
            EngineEvent::ClientWritability(edge) => {
                let writable = edge == crate::outbound::WritabilityEdge::BecameWritable;
                if let Some(gate) = self.backpressure.on_client_writability_changed(writable) {
                    let _ = self.server_autoread_tx.send(gate == ReadGate::Unblock);
                }
            }
            EngineEvent::ServerWritability(edge) => {
                let writable = edge == crate::outbound::WritabilityEdge::BecameWritable;
                if let Some(gate) = self.backpressure.on_server_writability_changed(writable) {
                    let _ = self.client_autoread_tx.send(gate == ReadGate::Unblock);
                }
            }
            EngineEvent::ServerSelected(decision) => {
                let route = Route {
                    remote: decision.remote,
                    filters: decision.filters,
                    virtual_cluster: decision.virtual_cluster,
                };
                self.metrics
                    .state_transition(&self.conn_id.to_string(), self.state.tag(), "connecting");
                self.state = SessionState::Connecting { route };
            }
            EngineEvent::Connected(socket) => self.on_connected(socket).await?,
            EngineEvent::ConnectFailed(err) => {
                return Err(ProxyError::ServerException(err));
            }
            EngineEvent::NetFilterFailed => {
                return Err(ProxyError::FilterError {
                    filter_name: "net_filter".into(),
                    source: anyhow::anyhow!("no server was selected for this connection"),
                });
            }
        }
        Ok(())
    }

    async fn handle_client_frame(&mut self, frame: ClientFrame) -> Result<(), ProxyError> {
        match (&self.state, frame) {
            (SessionState::ClientActive, ClientFrame::Preamble(preamble)) => {
                self.state = SessionState::HaProxy { preamble };
            }
            (SessionState::HaProxy { .. }, ClientFrame::Preamble(_)) => {
                return Err(ProxyError::ProtocolViolation(
                    "second PROXY preamble on the same connection".into(),
                ));
            }
            (SessionState::ClientActive, ClientFrame::Request(req))
            | (SessionState::HaProxy { .. }, ClientFrame::Request(req)) => {
                self.begin_handshake(req).await?;
            }
            (SessionState::SelectingServer { .. }, frame) | (SessionState::Connecting { .. }, frame) => {
                let wire_len = frame.wire_len();
                self.pre_forward_buffer.push(frame, wire_len)?;
            }
            (SessionState::Forwarding { .. }, ClientFrame::Request(req)) => {
                self.handle_client_request(req).await?;
            }
            (SessionState::Forwarding { .. }, ClientFrame::Preamble(_)) => {
                return Err(ProxyError::ProtocolViolation(
                    "PROXY preamble received after forwarding began".into(),
                ));
            }
            (SessionState::ApiVersions { .. }, frame) => {
                // The client's ApiVersions request was already answered
                // locally (spec §4.7 `ApiVersions` state); this is the
                // *next* frame, which is what actually triggers server
                // selection — the broker is not contacted just to
                // answer ApiVersions.
                let (client_software, preamble) = match &self.state {
                    SessionState::ApiVersions {
                        client_software,
                        preamble,
                    } => (client_software.clone(), preamble.clone()),
                    _ => unreachable!(),
                };
                let wire_len = frame.wire_len();
                self.pre_forward_buffer.push(frame, wire_len)?;
                self.begin_server_selection(client_software, preamble);
            }
            (SessionState::Closing { .. }, _) | (SessionState::Closed, _) => {}
            (SessionState::Startup, _) => {
                return Err(ProxyError::ProtocolViolation(
                    "frame received before the connection was marked active".into(),
                ));
            }
        }
        Ok(())
    }

    /// The first Kafka request frame of the connection (spec §4.4,
    /// §4.7): if it is `ApiVersions` and SASL offload is enabled, the
    /// proxy answers it locally and waits for the client's next request
    /// before selecting a server; otherwise this frame is what triggers
    /// net-filter server selection directly.
    async fn begin_handshake(&mut self, frame: RequestFrame) -> Result<(), ProxyError> {
        let preamble = self.take_preamble();
        let mut client_software = ClientSoftware::default();

        if frame.api_key == ApiKey::ApiVersionsKey {
            if let crate::frame::RequestBody::Decoded(RequestKind::ApiVersions(req)) = &frame.body {
                let (name, version) = kafka_support::client_software(req);
                client_software = ClientSoftware { name, version };
            }
            if self.config.sasl_authentication_offload {
                let bytes =
                    kafka_support::encode_local_api_versions_response(frame.correlation_id, frame.api_version)?;
                if let Some(edge) = self.downstream_writer.enqueue(bytes.freeze()) {
                    let _ = self.tx.send(EngineEvent::ClientWritability(edge));
                }
                self.state = SessionState::ApiVersions {
                    client_software,
                    preamble,
                };
                // The broker is not contacted yet (spec §8 scenario 2):
                // server selection only starts once the client sends
                // its first non-ApiVersions request. The ApiVersions
                // frame itself is still buffered so it drains into the
                // upstream pipeline in arrival order once forwarding
                // begins (invariant 5).
                let wire_len = frame.wire_len;
                self.pre_forward_buffer
                    .push(ClientFrame::Request(frame), wire_len)?;
                return Ok(());
            }
        }

        self.state = SessionState::SelectingServer {
            client_software: client_software.clone(),
            preamble: preamble.clone(),
        };
        let wire_len = frame.wire_len;
        self.pre_forward_buffer
            .push(ClientFrame::Request(frame), wire_len)?;
        self.begin_server_selection(client_software, preamble);
        Ok(())
    }

    fn take_preamble(&mut self) -> Option<HaProxyPreamble> {
        match &self.state {
            SessionState::HaProxy { preamble } => Some(preamble.clone()),
            _ => None,
        }
    }

    fn begin_server_selection(&mut self, client_software: ClientSoftware, preamble: Option<HaProxyPreamble>) {
        self.state = SessionState::SelectingServer {
            client_software: client_software.clone(),
            preamble: preamble.clone(),
        };
        let net_filter = self.net_filter.clone();
        let tx = self.tx.clone();
        let ha_proxy_source: Option<(IpAddr, u16)> = preamble.and_then(|p| p.source);
        tokio::spawn(async move {
            let (context, rx) = NetFilterContext::new(
                client_software.name,
                client_software.version,
                ha_proxy_source,
            );
            net_filter.select_server(context).await;
            let decision = match rx.await {
                Ok(decision) => decision,
                Err(_) => {
                    let _ = tx.send(EngineEvent::NetFilterFailed);
                    return;
                }
            };
            let host = decision.remote.host.clone();
            let port = decision.remote.port;
            if tx.send(EngineEvent::ServerSelected(decision)).is_err() {
                return;
            }
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(socket) => {
                    let _ = tx.send(EngineEvent::Connected(socket));
                }
                Err(err) => {
                    let _ = tx.send(EngineEvent::ConnectFailed(err));
                }
            }
        });
    }

    async fn on_connected(&mut self, socket: TcpStream) -> Result<(), ProxyError> {
        let route = match &self.state {
            SessionState::Connecting { route } => route.clone(),
            _ => {
                return Err(ProxyError::ProtocolViolation(
                    "connected event received outside the Connecting state".into(),
                ))
            }
        };
        let (server_read, server_write) = socket.into_split();

        let (up_tx, up_rx) = mpsc::unbounded_channel::<UpstreamEvent>();
        relay(up_rx, self.tx.clone(), EngineEvent::Upstream);
        let server_autoread_rx = self
            .server_autoread_rx
            .take()
            .expect("server autoread receiver consumed exactly once");
        upstream::spawn_reader(
            server_read,
            self.config.max_frame_size_bytes,
            server_autoread_rx,
            self.correlations.clone(),
            up_tx,
        );

        let (server_edge_tx, server_edge_rx) = mpsc::unbounded_channel();
        relay(server_edge_rx, self.tx.clone(), EngineEvent::ServerWritability);
        self.upstream_writer = Some(Arc::new(UpstreamWriter::spawn(server_write, server_edge_tx)));

        self.metrics
            .state_transition(&self.conn_id.to_string(), self.state.tag(), "forwarding");
        self.state = SessionState::Forwarding { route };

        let buffered = self.pre_forward_buffer.drain();
        for frame in buffered {
            if let ClientFrame::Request(req) = frame {
                self.handle_client_request(req).await?;
            }
        }
        Ok(())
    }

    fn request_filters(&self) -> Vec<Arc<dyn RequestFilter>> {
        match &self.state {
            SessionState::Forwarding { route } => route
                .filters
                .iter()
                .filter_map(|f| f.clone().as_request_filter())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Reverse of `request_filters`'s order (spec L3): for a chain
    /// `[F1, F2]`, F1 sees the request before F2 but the response after
    /// F2, the onion-ordering symmetry around the broker round trip.
    fn response_filters(&self) -> Vec<Arc<dyn ResponseFilter>> {
        match &self.state {
            SessionState::Forwarding { route } => route
                .filters
                .iter()
                .rev()
                .filter_map(|f| f.clone().as_response_filter())
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn handle_client_request(&mut self, frame: RequestFrame) -> Result<(), ProxyError> {
        let virtual_cluster = match &self.state {
            SessionState::Forwarding { route } => route.virtual_cluster.clone(),
            _ => return Err(ProxyError::ProtocolViolation("not forwarding".into())),
        };
        let upstream_writer = self
            .upstream_writer
            .clone()
            .expect("Forwarding implies an upstream writer");

        let correlation_id = frame.correlation_id;
        let api_key = frame.api_key;
        let api_version = frame.api_version;

        let context = EngineFilterContext {
            correlation_id,
            correlations: self.correlations.clone(),
            upstream_writer: upstream_writer.clone(),
            next_internal_correlation_id: self.next_internal_correlation_id.clone(),
            virtual_cluster,
            tx: self.tx.clone(),
        };

        let filters = self.request_filters();
        let outcome = match pipeline::run_request_filters(frame, &filters, &context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.begin_closing(CloseCause::from_error_with_correlation(err, correlation_id))
                    .await;
                return Ok(());
            }
        };
        match outcome {
            RequestOutcome::Forward(frame) => {
                if !self
                    .correlations
                    .insert_external(frame.correlation_id, frame.api_key, frame.api_version)
                {
                    self.begin_closing(CloseCause::from_error_with_correlation(
                        ProxyError::ProtocolViolation(format!(
                            "correlation id {} already in flight on this upstream channel",
                            frame.correlation_id
                        )),
                        correlation_id,
                    ))
                    .await;
                    return Ok(());
                }
                let mut buf = BytesMut::new();
                kafka_support::encode_request(&frame, &mut buf)?;
                let len = buf.len();
                if let Some(edge) = upstream_writer.enqueue(buf.freeze()) {
                    let _ = self.tx.send(EngineEvent::ServerWritability(edge));
                }
                self.metrics.bytes_forwarded(Direction::ClientToServer, len);
            }
            RequestOutcome::Drop => {}
            RequestOutcome::ShortCircuit {
                header,
                body,
                close_after,
            } => {
                self.metrics
                    .short_circuited(&self.conn_id.to_string(), &format!("{api_key:?}"));
                let header_version = kafka_support::response_header_version(api_key, api_version);
                self.send_short_circuit(
                    api_key,
                    api_version,
                    header_version,
                    correlation_id,
                    header,
                    body,
                )?;
                if close_after {
                    self.begin_closing(CloseCause::clean()).await;
                }
            }
            RequestOutcome::Disconnect => {
                self.begin_closing(CloseCause::clean()).await;
            }
        }
        Ok(())
    }

    fn send_short_circuit(
        &mut self,
        api_key: ApiKey,
        api_version: i16,
        header_version: i16,
        correlation_id: i32,
        header: Option<ResponseHeader>,
        body: ResponseKind,
    ) -> Result<(), ProxyError> {
        let frame = ResponseFrame {
            api_key,
            api_version,
            correlation_id,
            header_version,
            header: header.unwrap_or_else(|| ResponseHeader::default().with_correlation_id(correlation_id)),
            body: ResponseBody::Decoded(body),
            destination: ResponseDestination::External,
        };
        let mut buf = BytesMut::new();
        kafka_support::encode_response(&frame, &mut buf)?;
        if let Some(edge) = self.downstream_writer.enqueue(buf.freeze()) {
            let _ = self.tx.send(EngineEvent::ClientWritability(edge));
        }
        Ok(())
    }

    async fn handle_server_frame(&mut self, frame: ResponseFrame) -> Result<(), ProxyError> {
        match frame.destination {
            ResponseDestination::Internal { promise, .. } => {
                let _ = promise.send(frame.body);
                Ok(())
            }
            ResponseDestination::External => {
                let api_key = frame.api_key;
                let virtual_cluster = match &self.state {
                    SessionState::Forwarding { route } => route.virtual_cluster.clone(),
                    _ => String::new(),
                };
                let context = EngineFilterContext {
                    correlation_id: frame.correlation_id,
                    correlations: self.correlations.clone(),
                    upstream_writer: self
                        .upstream_writer
                        .clone()
                        .expect("external response implies an upstream writer"),
                    next_internal_correlation_id: self.next_internal_correlation_id.clone(),
                    virtual_cluster,
                    tx: self.tx.clone(),
                };
                let filters = self.response_filters();
                let correlation_id = frame.correlation_id;
                let outcome = match pipeline::run_response_filters(frame, &filters, &context).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.begin_closing(CloseCause::from_error_with_correlation(err, correlation_id))
                            .await;
                        return Ok(());
                    }
                };
                match outcome {
                    ResponseOutcome::Forward(frame) => {
                        let mut buf = BytesMut::new();
                        kafka_support::encode_response(&frame, &mut buf)?;
                        let len = buf.len();
                        if let Some(edge) = self.downstream_writer.enqueue(buf.freeze()) {
                            let _ = self.tx.send(EngineEvent::ClientWritability(edge));
                        }
                        self.metrics.bytes_forwarded(Direction::ServerToClient, len);
                    }
                    ResponseOutcome::Drop => {}
                    ResponseOutcome::Disconnect => {
                        self.metrics
                            .protocol_error(&self.conn_id.to_string(), &format!("{api_key:?}"));
                        self.begin_closing(CloseCause::clean()).await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Open Question (a) (SPEC_FULL.md §4): dropping the write queues'
    /// senders lets their background tasks flush whatever is already
    /// enqueued — including a short-circuit response sent moments ago
    /// in the same event — before the socket is shut down, rather than
    /// racing a forced shutdown against the pending write.
    async fn begin_closing(&mut self, cause: CloseCause) {
        if self.state.is_closed() {
            return;
        }
        let cause_text = cause
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "clean".into());
        warn!(cause = %cause_text, "closing connection");
        self.metrics
            .connection_closed(&self.conn_id.to_string(), &cause_text);

        if let SessionState::Forwarding { route } = &self.state {
            for filter in &route.filters {
                filter.on_closed();
            }
        }

        if let (Some(response_error), Some(correlation_id)) = (
            cause.error.as_ref().and_then(ProxyError::client_visible_kafka_error),
            cause.correlation_id,
        ) {
            if matches!(self.state, SessionState::Forwarding { .. }) {
                if let Some(entry) = self.correlations.remove(correlation_id) {
                    if matches!(entry.kind, EntryKind::External) {
                        match kafka_support::encode_client_visible_error(
                            entry.api_key,
                            entry.api_version,
                            correlation_id,
                            response_error,
                        ) {
                            Ok(Some(bytes)) => {
                                if let Some(edge) = self.downstream_writer.enqueue(bytes.freeze()) {
                                    let _ = self.tx.send(EngineEvent::ClientWritability(edge));
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(%err, "failed to encode client-visible error response");
                            }
                        }
                    }
                }
            }
        }

        self.correlations.drain_on_close();
        self.state = SessionState::Closed;
        info!("connection closed");
    }
}

/// `FilterContext` implementation handed to every filter invocation
/// (spec §4.3, §6). Its `originate_request` is the only place a filter
/// author's code can await a broker round trip; doing so serializes
/// this connection's event processing until the round trip completes,
/// which is the intended behavior (the chain cannot meaningfully
/// continue before the filter decides what to do with the answer).
struct EngineFilterContext {
    correlation_id: i32,
    correlations: CorrelationMap,
    upstream_writer: Arc<UpstreamWriter>,
    next_internal_correlation_id: Arc<AtomicI32>,
    virtual_cluster: String,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

#[async_trait]
impl FilterContext for EngineFilterContext {
    fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    async fn originate_request(
        &self,
        api_key: ApiKey,
        api_version: i16,
        body: RequestKind,
    ) -> anyhow::Result<ResponseBody> {
        let correlation_id = self
            .next_internal_correlation_id
            .fetch_add(1, Ordering::SeqCst);
        let frame = kafka_support::build_request_frame(api_key, api_version, correlation_id, body);
        let mut buf = BytesMut::new();
        kafka_support::encode_request(&frame, &mut buf)?;

        let (promise, rx) = oneshot::channel();
        self.correlations.insert_internal(
            correlation_id,
            api_key,
            api_version,
            format!("filter:{}", self.virtual_cluster),
            promise,
        );
        if let Some(edge) = self.upstream_writer.enqueue(buf.freeze()) {
            let _ = self.tx.send(EngineEvent::ServerWritability(edge));
        }

        rx.await
            .map_err(|_| anyhow::anyhow!("connection closed while awaiting an originated request"))
    }

    fn virtual_cluster(&self) -> &str {
        &self.virtual_cluster
    }
}
