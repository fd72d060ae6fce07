//! C5 — the downstream (client-side) channel handler (spec §4.4).
//!
//! A reader task does nothing but turn bytes into `ClientFrame`s and
//! hand them to the engine's event loop over an mpsc channel — no
//! decision logic lives in the reader, matching spec §5's "single
//! event loop thread per connection": only the engine task ever
//! inspects state. Writes go through the shared `OutboundQueue` so a
//! slow client never blocks the engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::codec::FrameReader;
use crate::error::ProxyError;
use crate::frame::{ClientFrame, RequestFrame};
use crate::kafka_support;
use crate::outbound::{OutboundQueue, WritabilityEdge};

/// Events a downstream reader task pushes to the engine. Mirrors
/// Netty's `channelRead`/`exceptionCaught`/`channelInactive` callbacks
/// (spec §6 "Downstream channel handler interface") as plain enum
/// variants instead of virtual methods.
pub enum DownstreamEvent {
    Frame(ClientFrame),
    Closed,
    Error(ProxyError),
}

/// Spawns the reader task for a client socket half. `max_frame_size`
/// bounds individual Kafka frames (spec §4.4 `onFrame` / oversized
/// frame close); the PROXY preamble, if any, is reported as the first
/// event. `autoread` gates the read loop between frames: when the
/// engine pauses client reads (backpressure from a full upstream write
/// queue, invariant I6), the reader blocks on `autoread.changed()`
/// instead of issuing another socket read.
pub fn spawn_reader<R>(
    read_half: R,
    max_frame_size: u32,
    mut autoread: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<DownstreamEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = FrameReader::new(read_half, max_frame_size);

        match reader.try_read_preamble().await {
            Ok(Some(preamble)) => {
                if tx.send(DownstreamEvent::Frame(ClientFrame::Preamble(preamble))).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                let _ = tx.send(DownstreamEvent::Error(err));
                return;
            }
        }

        loop {
            while !*autoread.borrow() {
                if autoread.changed().await.is_err() {
                    return;
                }
            }

            match reader.read_raw_frame().await {
                Ok(Some(raw)) => match decode_client_frame(raw) {
                    Ok(frame) => {
                        if tx.send(DownstreamEvent::Frame(ClientFrame::Request(frame))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(DownstreamEvent::Error(err));
                        return;
                    }
                },
                Ok(None) => {
                    let _ = tx.send(DownstreamEvent::Closed);
                    return;
                }
                Err(err) => {
                    let _ = tx.send(DownstreamEvent::Error(err));
                    return;
                }
            }
        }
    });
}

/// Only `ApiVersions` is decoded eagerly off the wire (the handshake
/// depends on its contents, spec §4.4 "inApiVersions"); everything
/// else starts life opaque and is promoted on demand by the pipeline
/// via `kafka_support::ensure_decoded_request` when a filter's
/// `should_deserialize` asks for it.
fn decode_client_frame(raw: Bytes) -> Result<RequestFrame, ProxyError> {
    let (api_key, _version, _correlation_id) = kafka_support::peek_request_prefix(&raw)?;
    if api_key == kafka_protocol::messages::ApiKey::ApiVersionsKey {
        kafka_support::decode_request(raw)
    } else {
        kafka_support::opaque_request_frame(raw)
    }
}

/// FIFO, no-partial-eviction buffer for frames read before
/// `Forwarding` is reached (PROXY preamble / `ApiVersions` / net-filter
/// selection, spec §4.4 "pre-forwarding buffering"). The only bound
/// enforced is total buffered bytes on admission — see
/// SPEC_FULL.md §4(b).
pub struct FrameBuffer {
    frames: std::collections::VecDeque<ClientFrame>,
    buffered_bytes: usize,
    max_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_bytes: usize) -> Self {
        FrameBuffer {
            frames: std::collections::VecDeque::new(),
            buffered_bytes: 0,
            max_bytes,
        }
    }

    /// Returns `Err` if admitting this frame would exceed the
    /// configured bound — the caller should treat this as the fatal
    /// `INVALID_REQUEST` close of spec §4.4. `wire_len` is the frame's
    /// actual on-wire byte size (`ClientFrame::wire_len`), not an
    /// estimate.
    pub fn push(&mut self, frame: ClientFrame, wire_len: usize) -> Result<(), ProxyError> {
        if self.buffered_bytes + wire_len > self.max_bytes {
            return Err(ProxyError::ProtocolViolation(format!(
                "pre-forwarding buffer would exceed {} bytes",
                self.max_bytes
            )));
        }
        self.buffered_bytes += wire_len;
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<ClientFrame> {
        self.buffered_bytes = 0;
        self.frames.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Owns the client write half. Thin wrapper over `OutboundQueue` that
/// also knows how to encode a `RequestFrame` back to the wire (used
/// only for loop-back cases like the locally-synthesized `ApiVersions`
/// response, which is a `ResponseFrame` — see `pipeline.rs`) and how to
/// perform a final flush-then-shutdown (Open Question (a) in
/// SPEC_FULL.md §4).
pub struct DownstreamWriter {
    queue: Arc<OutboundQueue>,
}

impl DownstreamWriter {
    pub fn spawn(
        write_half: OwnedWriteHalf,
        edge_tx: mpsc::UnboundedSender<WritabilityEdge>,
    ) -> Self {
        DownstreamWriter {
            queue: OutboundQueue::spawn(write_half, edge_tx, "downstream"),
        }
    }

    pub fn enqueue(&self, bytes: Bytes) -> Option<WritabilityEdge> {
        self.queue.enqueue(bytes)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.queue.outstanding_bytes()
    }
}

/// Applies the configured `tcp_nodelay` socket option to a freshly
/// accepted client connection (spec.md §6 config surface).
pub fn apply_tcp_nodelay(stream: &tokio::net::TcpStream, enabled: bool) {
    if let Err(err) = stream.set_nodelay(enabled) {
        debug!(%err, "failed to set TCP_NODELAY on downstream socket");
    }
}
