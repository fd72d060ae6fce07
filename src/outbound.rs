//! Shared outbound-write plumbing for the downstream and upstream
//! channel handlers (C5/C6, spec §4.4/§4.5 — "mirror of C5 on the
//! broker side").
//!
//! Kafka's Netty-based source relies on Netty's per-channel outbound
//! buffer crossing a high/low watermark to fire
//! `channelWritabilityChanged`. Tokio has no equivalent built in for a
//! plain `TcpStream`, so this module reproduces the same edge-triggered
//! signal explicitly: a background writer task drains an unbounded
//! queue while a byte counter tracks how much is still outstanding;
//! crossing the high watermark emits an unwritable edge, crossing back
//! under the low watermark emits a writable edge. `forward`/`send`
//! never block the caller — that is what lets the connection engine
//! (spec §5: "No operation in the core blocks the thread") react to a
//! full write queue by pausing reads on the *other* side instead of
//! stalling its own event loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// 1 MiB / 256 KiB, the same order of magnitude as Netty's default
/// `WriteBufferWaterMark` (64 KiB low / 64 KiB high scaled up for
/// Kafka-sized frames).
pub const DEFAULT_HIGH_WATERMARK: usize = 1024 * 1024;
pub const DEFAULT_LOW_WATERMARK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritabilityEdge {
    BecameUnwritable,
    BecameWritable,
}

pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    outstanding: Arc<AtomicUsize>,
    unwritable: std::sync::atomic::AtomicBool,
    high_watermark: usize,
    low_watermark: usize,
}

impl OutboundQueue {
    /// Spawns the writer task and returns the queue handle. Writability
    /// edges are delivered on `edge_tx`.
    pub fn spawn<W>(
        mut write_half: W,
        edge_tx: mpsc::UnboundedSender<WritabilityEdge>,
        label: &'static str,
    ) -> Arc<Self>
    where
        W: AsyncWriteExt + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(OutboundQueue {
            tx,
            outstanding: outstanding.clone(),
            unwritable: std::sync::atomic::AtomicBool::new(false),
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        });
        let queue_for_task = queue.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let len = bytes.len();
                if let Err(err) = write_half.write_all(&bytes).await {
                    warn!(%label, %err, "write failed, stopping outbound loop");
                    break;
                }
                let remaining = outstanding.fetch_sub(len, Ordering::SeqCst) - len;
                if remaining <= queue_for_task.low_watermark
                    && queue_for_task.unwritable.swap(false, Ordering::SeqCst)
                {
                    let _ = edge_tx.send(WritabilityEdge::BecameWritable);
                }
            }
            let _ = write_half.shutdown().await;
        });
        queue
    }

    /// Enqueues a frame for writing. Never blocks. Returns the
    /// writability edge this enqueue triggered, if any (the caller is
    /// expected to also be told about it via the edge channel, but
    /// returning it directly lets the immediate caller react without
    /// waiting a full event-loop turn).
    pub fn enqueue(&self, bytes: Bytes) -> Option<WritabilityEdge> {
        let len = bytes.len();
        let prior = self.outstanding.fetch_add(len, Ordering::SeqCst);
        let _ = self.tx.send(bytes);
        if prior + len > self.high_watermark && !self.unwritable.swap(true, Ordering::SeqCst) {
            return Some(WritabilityEdge::BecameUnwritable);
        }
        None
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}
