//! A logical stream on a multiplexer.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::dupe::Dupe;
use crate::frame::{Frame, FinalizedFrame, MAX_PAYLOAD};
use bytes::Bytes;
use futures_util::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

/// One end of a logical stream. Reads and writes are subject to the
/// per-stream credit windows; dropping the stream reaps it on both ends.
#[derive(Debug)]
pub struct MuxStream {
    /// Data frames routed to us by the processing task.
    /// An empty `Bytes` means EOF (the peer sent `Fin` or went away).
    pub(crate) frame_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Stream ID on the wire.
    pub(crate) flow_id: u32,
    /// The opener's link info (empty on locally-opened streams).
    pub(crate) link: Bytes,
    /// Set once our `Fin` is queued or the multiplexer died; writes then
    /// fail with `BrokenPipe`.
    pub(crate) fin_sent: Arc<AtomicBool>,
    /// Bytes we may still send before the peer must grant more credit.
    pub(crate) send_credit: Arc<AtomicU32>,
    /// Bytes the peer may still send to us. Shared with the processing
    /// task, which debits it on every incoming `Data` frame.
    pub(crate) recv_budget: Arc<AtomicU32>,
    /// Bytes consumed by the reader since the last `WindowUpdate`.
    pub(crate) wnd_consumed: u32,
    /// Consumed bytes beyond this trigger a `WindowUpdate`.
    pub(crate) wnd_threshold: u32,
    /// Wakes a writer blocked on zero send credit.
    pub(crate) writer_waker: Arc<AtomicWaker>,
    /// Remainder of a partially-consumed data chunk.
    pub(crate) buf: Bytes,
    pub(crate) read_eof: bool,
    pub(crate) frame_tx: mpsc::UnboundedSender<FinalizedFrame>,
    pub(crate) dropped_streams_tx: mpsc::UnboundedSender<u32>,
}

impl MuxStream {
    /// Wire ID of this stream.
    #[must_use]
    pub const fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Link info carried in the peer's `SYN` frame. Empty for streams we
    /// opened ourselves.
    #[must_use]
    pub fn link(&self) -> &Bytes {
        &self.link
    }

    /// Grant the peer credit for the bytes we have consumed once we cross
    /// the threshold.
    fn maybe_send_window_update(&mut self) {
        if self.wnd_consumed >= self.wnd_threshold {
            trace!(
                flow_id = self.flow_id,
                delta = self.wnd_consumed,
                "sending window update"
            );
            // Failure means the multiplexer is gone; the reader will see EOF.
            self.frame_tx
                .send(Frame::new_window_update(self.flow_id, self.wnd_consumed).finalize())
                .ok();
            self.recv_budget
                .fetch_add(self.wnd_consumed, Ordering::Relaxed);
            self.wnd_consumed = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buf.is_empty() {
                let n = self.buf.len().min(buf.remaining());
                let chunk = self.buf.split_to(n);
                buf.put_slice(&chunk);
                self.wnd_consumed = self.wnd_consumed.saturating_add(n as u32);
                self.maybe_send_window_update();
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }
            match self.frame_rx.poll_recv(cx) {
                Poll::Ready(Some(data)) if data.is_empty() => {
                    self.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(data)) => {
                    self.buf = data;
                    // Loop to copy out of the fresh chunk.
                }
                Poll::Ready(None) => {
                    // Processing task gone; equivalent to EOF.
                    self.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.fin_sent.load(Ordering::Relaxed) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let want = buf.len().min(MAX_PAYLOAD);
        loop {
            let credit = self.send_credit.load(Ordering::Acquire);
            if credit == 0 {
                self.writer_waker.register(cx.waker());
                // Re-check after registering so a concurrent `WindowUpdate`
                // or teardown cannot be lost.
                if self.fin_sent.load(Ordering::Relaxed) {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                if self.send_credit.load(Ordering::Acquire) == 0 {
                    return Poll::Pending;
                }
                continue;
            }
            let take = want.min(credit as usize);
            if self
                .send_credit
                .compare_exchange_weak(
                    credit,
                    credit - take as u32,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            let frame =
                Frame::new_data(self.flow_id, Bytes::copy_from_slice(&buf[..take])).finalize();
            return match self.frame_tx.send(frame) {
                Ok(()) => Poll::Ready(Ok(take)),
                Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            };
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Ask the writer task to flush the sink; data order is preserved
        // because the marker goes through the same queue.
        match self.frame_tx.send(FinalizedFrame::flush()) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.fin_sent.swap(true, Ordering::Relaxed) {
            self.frame_tx
                .send(Frame::new_fin(self.flow_id).finalize())
                .ok();
            self.frame_tx.send(FinalizedFrame::flush()).ok();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        // The processing task sends `Rst` if we never shut down cleanly.
        self.dropped_streams_tx.send(self.flow_id).ok();
    }
}

/// Internal per-stream state kept by the processing task.
#[derive(Debug)]
pub(crate) struct StreamData {
    pub(crate) sender: mpsc::UnboundedSender<Bytes>,
    pub(crate) fin_sent: Arc<AtomicBool>,
    /// The peer half-closed its direction; further `Data` is a violation.
    pub(crate) fin_rcvd: bool,
    pub(crate) send_credit: Arc<AtomicU32>,
    pub(crate) recv_budget: Arc<AtomicU32>,
    pub(crate) writer_waker: Arc<AtomicWaker>,
}

impl StreamData {
    /// Build the paired user/task halves of a stream.
    pub(crate) fn new(
        flow_id: u32,
        peer_rwnd: u32,
        our_rwnd: u32,
        link: Bytes,
        frame_tx: mpsc::UnboundedSender<FinalizedFrame>,
        dropped_streams_tx: mpsc::UnboundedSender<u32>,
    ) -> (MuxStream, Self) {
        let (sender, frame_rx) = mpsc::unbounded_channel();
        let fin_sent = Arc::new(AtomicBool::new(false));
        let send_credit = Arc::new(AtomicU32::new(peer_rwnd));
        let recv_budget = Arc::new(AtomicU32::new(our_rwnd));
        let writer_waker = Arc::new(AtomicWaker::new());
        let data = Self {
            sender,
            fin_sent: fin_sent.dupe(),
            fin_rcvd: false,
            send_credit: send_credit.dupe(),
            recv_budget: recv_budget.dupe(),
            writer_waker: writer_waker.dupe(),
        };
        let stream = MuxStream {
            frame_rx,
            flow_id,
            link,
            fin_sent,
            send_credit,
            recv_budget,
            wnd_consumed: 0,
            wnd_threshold: our_rwnd / 2,
            writer_waker,
            buf: Bytes::new(),
            read_eof: false,
            frame_tx,
            dropped_streams_tx,
        };
        (stream, data)
    }
}
