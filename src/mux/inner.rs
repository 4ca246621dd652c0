//! Multiplexer processing task.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::dupe::Dupe;
use crate::frame::{FinalizedFrame, Frame, Payload, HEADER_LEN};
use crate::stream::StreamData;
use crate::timing::{OptionalDuration, OptionalInterval};
use crate::{Error, IncomingStream, Result};
use bytes::Bytes;
use futures_util::future::poll_fn;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// The state of one stream ID slot.
#[derive(Debug)]
pub(crate) enum StreamSlot {
    /// We sent `SYN` and are waiting for `CONN_SUCCESS` or `CONN_FAIL`.
    /// The `Err` arm of the reply carries the refusal reason.
    SynSent(oneshot::Sender<std::result::Result<crate::MuxStream, Bytes>>),
    /// The peer sent `SYN`; the user holds the [`IncomingStream`] and has
    /// not yet accepted or rejected it.
    Accepting { peer_rwnd: u32 },
    Established(StreamData),
}

/// Shared handle between the user-facing [`Multiplexor`](crate::Multiplexor)
/// and its processing task.
pub(crate) struct MultiplexorInner {
    /// Where streams and the multiplexor queue frames to be sent.
    pub(crate) tx_frame_tx: mpsc::UnboundedSender<FinalizedFrame>,
    /// Live stream slots, keyed by stream ID.
    pub(crate) streams: Arc<RwLock<HashMap<u32, StreamSlot>>>,
    /// Channel for notifying the task of a dropped `MuxStream`.
    /// Sending 0 means the multiplexor itself is closing.
    pub(crate) dropped_streams_tx: mpsc::UnboundedSender<u32>,
    pub(crate) keepalive_interval: OptionalDuration,
    pub(crate) disconnect_timeout: std::time::Duration,
    /// Stamped by the reader on every `Pong`.
    pub(crate) last_pong: Arc<Mutex<Instant>>,
    /// Receive window advertised for every stream we take part in.
    pub(crate) rwnd: u32,
    /// Set once the processing task has wound down.
    pub(crate) closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MultiplexorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexorInner")
            .field("keepalive_interval", &self.keepalive_interval)
            .field("rwnd", &self.rwnd)
            .finish_non_exhaustive()
    }
}

impl Dupe for MultiplexorInner {
    #[inline]
    fn dupe(&self) -> Self {
        Self {
            tx_frame_tx: self.tx_frame_tx.dupe(),
            streams: self.streams.dupe(),
            dropped_streams_tx: self.dropped_streams_tx.dupe(),
            keepalive_interval: self.keepalive_interval,
            disconnect_timeout: self.disconnect_timeout,
            last_pong: self.last_pong.dupe(),
            rwnd: self.rwnd,
            closed: self.closed.dupe(),
        }
    }
}

/// Channels handed to the processing task at spawn.
pub(crate) struct TaskData {
    pub(crate) accept_stream_tx: mpsc::Sender<IncomingStream>,
    pub(crate) tx_frame_rx: mpsc::UnboundedReceiver<FinalizedFrame>,
    pub(crate) dropped_streams_rx: mpsc::UnboundedReceiver<u32>,
}

impl MultiplexorInner {
    /// Processing task. Owns the underlying connection; everything else
    /// reaches it through channels. Runs until the peer goes away, a
    /// protocol error occurs, or the multiplexor is closed locally.
    #[tracing::instrument(skip_all, level = "trace")]
    pub(crate) async fn task<S: AsyncRead + AsyncWrite + Send + 'static>(
        self,
        conn: S,
        taskdata: TaskData,
    ) -> Result<()> {
        let TaskData {
            accept_stream_tx,
            mut tx_frame_rx,
            mut dropped_streams_rx,
        } = taskdata;
        let (mut rd, wr) = tokio::io::split(conn);
        let mut wr = BufWriter::new(wr);
        let result = {
            let mut dropped_fut = pin!(self.process_dropped_streams_task(&mut dropped_streams_rx));
            let mut send_fut = pin!(self.process_frame_send_task(&mut tx_frame_rx, &mut wr));
            let mut recv_fut = pin!(self.process_recv_task(&mut rd, &accept_stream_tx));
            poll_fn(|cx| {
                if let Poll::Ready(r) = dropped_fut.as_mut().poll(cx) {
                    debug!("mux dropped-streams task finished: {r:?}");
                    return Poll::Ready(r);
                }
                if let Poll::Ready(r) = recv_fut.as_mut().poll(cx) {
                    debug!("mux recv task finished: {r:?}");
                    return Poll::Ready(r);
                }
                if let Poll::Ready(r) = send_fut.as_mut().poll(cx) {
                    debug!("mux send task finished: {r:?}");
                    return Poll::Ready(r);
                }
                Poll::Pending
            })
            .await
        };
        self.wind_down(&mut tx_frame_rx, wr).await;
        result
    }

    /// Reap streams whose user half was dropped. Returns when the
    /// multiplexor itself is being closed.
    async fn process_dropped_streams_task(
        &self,
        dropped_streams_rx: &mut mpsc::UnboundedReceiver<u32>,
    ) -> Result<()> {
        while let Some(flow_id) = dropped_streams_rx.recv().await {
            if flow_id == 0 {
                debug!("mux closed locally");
                break;
            }
            self.close_stream(flow_id, false);
        }
        Ok(())
    }

    /// Drain the outbound frame queue into the transport and emit
    /// keepalive pings. Never returns `Ok`.
    async fn process_frame_send_task<W: AsyncWrite + Unpin>(
        &self,
        frame_rx: &mut mpsc::UnboundedReceiver<FinalizedFrame>,
        wr: &mut W,
    ) -> Result<()> {
        let mut interval = OptionalInterval::from(self.keepalive_interval);
        // A missed tick means we were busy doing networking; no make-up pings.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.last_pong.lock().elapsed() > self.disconnect_timeout {
                        return Err(Error::PingTimeout);
                    }
                    trace!("sending keepalive ping");
                    wr.write_all(Frame::new_ping().finalize().as_bytes()).await?;
                    wr.flush().await?;
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        // Cannot happen: `Self` holds a sender.
                        panic!("frame queue closed while the mux is alive (this is a bug)");
                    };
                    if frame.is_flush() {
                        wr.flush().await?;
                        continue;
                    }
                    wr.write_all(frame.as_bytes()).await?;
                    // Batch consecutive `Data` frames; everything else is
                    // latency-sensitive and flushes immediately.
                    if frame.opcode() != Some(crate::frame::OpCode::Data) || frame_rx.is_empty() {
                        wr.flush().await?;
                    }
                }
            }
        }
    }

    /// Read frames off the transport and dispatch them.
    /// Returns `Ok` on a clean EOF from the peer.
    async fn process_recv_task<R: AsyncRead + Unpin>(
        &self,
        rd: &mut R,
        accept_stream_tx: &mpsc::Sender<IncomingStream>,
    ) -> Result<()> {
        let mut header = [0_u8; HEADER_LEN];
        loop {
            // A clean close may only happen on a frame boundary.
            let n = rd.read(&mut header[..1]).await?;
            if n == 0 {
                debug!("transport closed by peer");
                return Ok(());
            }
            rd.read_exact(&mut header[1..]).await?;
            let id = u32::from_be_bytes(
                header[0..4].try_into().expect("header slice (this is a bug)"),
            );
            let opcode = header[4];
            let len = u16::from_be_bytes(
                header[5..7].try_into().expect("header slice (this is a bug)"),
            );
            let payload = if len == 0 {
                Bytes::new()
            } else {
                let mut buf = vec![0_u8; usize::from(len)];
                rd.read_exact(&mut buf).await?;
                Bytes::from(buf)
            };
            let frame = Frame::parse(id, opcode, payload)?;
            self.process_frame(frame, accept_stream_tx).await?;
        }
    }

    /// Flush whatever is already queued, EOF every live stream, and mark
    /// the multiplexor closed.
    async fn wind_down<W: AsyncWrite + Unpin>(
        &self,
        frame_rx: &mut mpsc::UnboundedReceiver<FinalizedFrame>,
        mut wr: W,
    ) {
        debug!("winding down multiplexer");
        self.closed.store(true, Ordering::Relaxed);
        // Stop the streams from writing before we EOF their readers.
        for slot in self.streams.read().values() {
            if let StreamSlot::Established(data) = slot {
                data.fin_sent.store(true, Ordering::Relaxed);
                data.writer_waker.wake();
            }
        }
        // Best-effort flush of frames that were queued before the teardown.
        while let Ok(frame) = frame_rx.try_recv() {
            if frame.is_flush() {
                continue;
            }
            if wr.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
        wr.flush().await.ok();
        wr.shutdown().await.ok();
        let slots = std::mem::take(&mut *self.streams.write());
        for (_, slot) in slots {
            match slot {
                StreamSlot::Established(data) => {
                    // EOF the reader; writers were already cut off above.
                    data.sender.send(Bytes::new()).ok();
                }
                StreamSlot::SynSent(sender) => {
                    sender
                        .send(Err(Bytes::from_static(b"multiplexer closed")))
                        .ok();
                }
                StreamSlot::Accepting { .. } => {}
            }
        }
    }
}

impl MultiplexorInner {
    /// Dispatch one frame.
    #[tracing::instrument(skip_all, fields(flow_id = frame.id), level = "trace")]
    async fn process_frame(
        &self,
        frame: Frame,
        accept_stream_tx: &mpsc::Sender<IncomingStream>,
    ) -> Result<()> {
        let Frame { id, payload } = frame;
        match payload {
            Payload::NewConn { rwnd, link } => {
                // A SYN for an ID that is in use means the peer lost track
                // of its own allocator; nothing on this transport can be
                // trusted any more.
                if self.streams.read().contains_key(&id) {
                    self.tx_frame_tx.send(Frame::new_rst(id).finalize()).ok();
                    return Err(Error::Protocol("SYN for an existing stream ID"));
                }
                self.streams
                    .write()
                    .insert(id, StreamSlot::Accepting { peer_rwnd: rwnd });
                let incoming = IncomingStream {
                    flow_id: id,
                    link,
                    peer_rwnd: rwnd,
                    inner: self.dupe(),
                    decided: false,
                };
                if accept_stream_tx.send(incoming).await.is_err() {
                    // User side is gone; no point keeping the transport.
                    return Err(Error::Closed);
                }
            }
            Payload::ConnSuccess { rwnd } => {
                let slot = self.streams.write().remove(&id);
                match slot {
                    Some(StreamSlot::SynSent(reply)) => {
                        let (stream, data) = StreamData::new(
                            id,
                            rwnd,
                            self.rwnd,
                            Bytes::new(),
                            self.tx_frame_tx.dupe(),
                            self.dropped_streams_tx.dupe(),
                        );
                        self.streams
                            .write()
                            .insert(id, StreamSlot::Established(data));
                        if reply.send(Ok(stream)).is_err() {
                            // Opener gave up (dial timeout); reap the slot.
                            debug!("opener cancelled before CONN_SUCCESS");
                            self.close_stream(id, false);
                        }
                    }
                    Some(other) => {
                        // Put it back; this is a peer bug, not ours.
                        self.streams.write().insert(id, other);
                        warn!("CONN_SUCCESS for a stream not in SYN_SENT");
                        self.tx_frame_tx.send(Frame::new_rst(id).finalize()).ok();
                    }
                    None => {
                        debug!("late CONN_SUCCESS, sending RST");
                        self.tx_frame_tx.send(Frame::new_rst(id).finalize()).ok();
                    }
                }
            }
            Payload::ConnFail { reason } => match self.streams.write().remove(&id) {
                Some(StreamSlot::SynSent(reply)) => {
                    reply.send(Err(reason)).ok();
                }
                Some(other) => {
                    self.streams.write().insert(id, other);
                    warn!("CONN_FAIL for a stream not in SYN_SENT");
                }
                None => debug!("late CONN_FAIL ignored"),
            },
            Payload::Data(data) => self.process_data(id, data),
            Payload::WindowUpdate { delta } => {
                if let Some(StreamSlot::Established(data)) = self.streams.read().get(&id) {
                    data.send_credit.fetch_add(delta, Ordering::AcqRel);
                    data.writer_waker.wake();
                } else {
                    debug!("window update for unknown stream, dropping");
                }
            }
            Payload::Ping => {
                self.tx_frame_tx
                    .send(Frame::new_pong().finalize())
                    .map_err(|_| Error::Closed)?;
            }
            Payload::Pong => {
                *self.last_pong.lock() = Instant::now();
            }
            Payload::Fin => {
                let mut streams = self.streams.write();
                match streams.get_mut(&id) {
                    Some(StreamSlot::Established(data)) => {
                        data.fin_rcvd = true;
                        data.sender.send(Bytes::new()).ok();
                        if data.fin_sent.load(Ordering::Relaxed) {
                            // Both directions closed; reap.
                            streams.remove(&id);
                        }
                    }
                    _ => debug!("FIN for unknown stream, dropping"),
                }
            }
            Payload::Rst => {
                // `true`: never answer RST with RST.
                self.close_stream(id, true);
            }
            Payload::MsgSend(_) => {
                return Err(Error::Protocol("MSG_SEND inside a data multiplexer"));
            }
        }
        Ok(())
    }

    /// Route a `Data` frame to its stream, enforcing the receive window.
    fn process_data(&self, id: u32, data: Bytes) {
        let violation = {
            let streams = self.streams.read();
            match streams.get(&id) {
                Some(StreamSlot::Established(sd)) => {
                    if sd.fin_rcvd {
                        Some("DATA after FIN")
                    } else {
                        let len = data.len() as u32;
                        let mut debited = false;
                        // Debit the receive budget; going below zero means
                        // the peer ignored our advertised window.
                        let mut cur = sd.recv_budget.load(Ordering::Acquire);
                        loop {
                            if len > cur {
                                break;
                            }
                            match sd.recv_budget.compare_exchange_weak(
                                cur,
                                cur - len,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            ) {
                                Ok(_) => {
                                    debited = true;
                                    break;
                                }
                                Err(now) => cur = now,
                            }
                        }
                        if debited {
                            // Receiver gone is handled by the drop path.
                            sd.sender.send(data).ok();
                            None
                        } else {
                            Some("peer overran the receive window")
                        }
                    }
                }
                _ => {
                    // Permits late-arriving packets from a just-closed
                    // stream; masks protocol bugs, hence the log.
                    debug!("data for unknown or closed stream, dropping");
                    None
                }
            }
        };
        if let Some(reason) = violation {
            warn!("{reason}, resetting stream");
            self.close_stream(id, false);
        }
    }

    /// Remove a stream slot. Sends `Rst` unless we already sent `Fin` or
    /// `inhibit_rst` is set (we are reacting to the peer's `Rst`).
    pub(crate) fn close_stream(&self, flow_id: u32, inhibit_rst: bool) {
        let removed = self.streams.write().remove(&flow_id);
        match removed {
            Some(StreamSlot::Established(data)) => {
                // EOF the reader half.
                data.sender.send(Bytes::new()).ok();
                let fin_sent = data.fin_sent.swap(true, Ordering::Relaxed);
                if !fin_sent && !inhibit_rst {
                    self.tx_frame_tx
                        .send(Frame::new_rst(flow_id).finalize())
                        .ok();
                }
                data.writer_waker.wake();
                trace!(flow_id, "stream reaped");
            }
            Some(StreamSlot::SynSent(reply)) => {
                reply.send(Err(Bytes::from_static(b"reset"))).ok();
                debug!(flow_id, "pending stream reset");
            }
            Some(StreamSlot::Accepting { .. }) => {
                debug!(flow_id, "un-accepted stream reset");
            }
            None => {
                trace!(flow_id, "nothing to close");
            }
        }
    }
}
