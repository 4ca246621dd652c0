//! A stream multiplexer: many logical streams over one ordered byte
//! transport, with per-stream credit windows and keepalive liveness.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

pub mod config;
mod dupe;
pub mod frame;
mod inner;
mod stream;
pub mod timing;

pub use crate::config::MuxConfig;
pub use crate::dupe::Dupe;
pub use crate::stream::MuxStream;

use crate::frame::Frame;
use crate::inner::{MultiplexorInner, StreamSlot, TaskData};
use crate::stream::StreamData;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The peer sent bytes that do not parse as a frame.
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
    /// The peer violated the protocol; the multiplexer is torn down.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// The peer stopped answering keepalive pings.
    #[error("peer stopped answering pings")]
    PingTimeout,
    /// The multiplexer is closed.
    #[error("multiplexer closed")]
    Closed,
    /// The peer refused our stream with `CONN_FAIL`.
    #[error("stream refused by peer: {0}")]
    StreamRefused(String),
}

/// Multiplexer result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which end of the underlying connection we are. The initiator allocates
/// odd stream IDs and the acceptor even ones, so simultaneous opens can
/// never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; allocates odd stream IDs.
    Client,
    /// Accepted the connection; allocates even stream IDs.
    Server,
}

/// A stream the peer asked to open. Call [`accept`](Self::accept) after the
/// local side is ready (e.g. the internal target dialed), or
/// [`reject`](Self::reject) with a short reason. Dropping it un-decided
/// resets the stream.
#[derive(Debug)]
pub struct IncomingStream {
    pub(crate) flow_id: u32,
    pub(crate) link: Bytes,
    pub(crate) peer_rwnd: u32,
    pub(crate) inner: MultiplexorInner,
    pub(crate) decided: bool,
}

impl IncomingStream {
    /// Link info carried in the peer's `SYN`.
    #[must_use]
    pub fn link(&self) -> &Bytes {
        &self.link
    }

    /// Wire ID of the stream being opened.
    #[must_use]
    pub const fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Establish the stream and answer `CONN_SUCCESS`.
    pub fn accept(mut self) -> Result<MuxStream> {
        self.decided = true;
        let stream = {
            let mut streams = self.inner.streams.write();
            if !matches!(streams.get(&self.flow_id), Some(StreamSlot::Accepting { .. })) {
                // Reset while the decision was pending.
                return Err(Error::Closed);
            }
            let (stream, data) = StreamData::new(
                self.flow_id,
                self.peer_rwnd,
                self.inner.rwnd,
                self.link.clone(),
                self.inner.tx_frame_tx.clone(),
                self.inner.dropped_streams_tx.clone(),
            );
            streams.insert(self.flow_id, StreamSlot::Established(data));
            stream
        };
        self.inner
            .tx_frame_tx
            .send(Frame::new_conn_success(self.flow_id, self.inner.rwnd).finalize())
            .map_err(|_| Error::Closed)?;
        Ok(stream)
    }

    /// Refuse the stream with `CONN_FAIL` and a short reason.
    pub fn reject(mut self, reason: &str) {
        self.decided = true;
        self.inner.streams.write().remove(&self.flow_id);
        self.inner
            .tx_frame_tx
            .send(Frame::new_conn_fail(self.flow_id, reason).finalize())
            .ok();
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        if !self.decided {
            self.inner.streams.write().remove(&self.flow_id);
            self.inner
                .tx_frame_tx
                .send(Frame::new_rst(self.flow_id).finalize())
                .ok();
        }
    }
}

/// A multiplexer over one ordered byte transport.
#[derive(Debug)]
pub struct Multiplexor {
    inner: MultiplexorInner,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingStream>>,
    next_id: AtomicU32,
}

impl Multiplexor {
    /// Wrap a connection and spawn the processing task.
    pub fn new<S: AsyncRead + AsyncWrite + Send + 'static>(
        conn: S,
        role: Role,
        config: MuxConfig,
    ) -> Self {
        let (tx_frame_tx, tx_frame_rx) = mpsc::unbounded_channel();
        let (dropped_streams_tx, dropped_streams_rx) = mpsc::unbounded_channel();
        let (accept_stream_tx, accept_rx) = mpsc::channel(config::ACCEPT_BACKLOG);
        let inner = MultiplexorInner {
            tx_frame_tx,
            streams: Arc::new(RwLock::new(HashMap::new())),
            dropped_streams_tx,
            keepalive_interval: config.keepalive_interval.into(),
            disconnect_timeout: config.disconnect_timeout,
            last_pong: Arc::new(Mutex::new(tokio::time::Instant::now())),
            rwnd: config.rwnd,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let taskdata = TaskData {
            accept_stream_tx,
            tx_frame_rx,
            dropped_streams_rx,
        };
        let task_inner = inner.dupe();
        tokio::spawn(async move {
            if let Err(e) = task_inner.task(conn, taskdata).await {
                trace!("mux task exited: {e}");
            }
        });
        Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
        }
    }

    /// Open a logical stream, shipping `link` in the `SYN` frame. Resolves
    /// once the peer answers `CONN_SUCCESS` or `CONN_FAIL`; wrap in a
    /// timeout for dial deadlines.
    pub async fn new_stream(&self, link: Bytes) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = {
            let mut streams = self.inner.streams.write();
            let id = loop {
                // Skip 0 (reserved for connection-level frames) and any ID
                // still occupied after a wraparound.
                let id = self.next_id.fetch_add(2, Ordering::Relaxed);
                if id != 0 && !streams.contains_key(&id) {
                    break id;
                }
            };
            streams.insert(id, StreamSlot::SynSent(reply_tx));
            id
        };
        trace!(flow_id = id, "opening stream");
        self.inner
            .tx_frame_tx
            .send(Frame::new_syn(id, self.inner.rwnd, link).finalize())
            .map_err(|_| Error::Closed)?;
        match reply_rx.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(reason)) => Err(Error::StreamRefused(
                String::from_utf8_lossy(&reason).into_owned(),
            )),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<IncomingStream> {
        self.accept_rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    /// Whether the processing task has wound down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Tear the multiplexer down: all streams EOF, peers get a transport
    /// close. Idempotent.
    pub fn close(&self) {
        self.inner.dropped_streams_tx.send(0).ok();
    }
}

impl Drop for Multiplexor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{OpCode, HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cfg() -> MuxConfig {
        MuxConfig {
            keepalive_interval: None,
            ..MuxConfig::default()
        }
    }

    fn pair() -> (Multiplexor, Multiplexor) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (
            Multiplexor::new(a, Role::Client, cfg()),
            Multiplexor::new(b, Role::Server, cfg()),
        )
    }

    #[tokio::test]
    async fn stream_bytes_are_fifo() {
        let (client, server) = pair();
        let open = tokio::spawn(async move {
            let mut s = client.new_stream(Bytes::from_static(b"link")).await.unwrap();
            for i in 0..100_u32 {
                s.write_all(&i.to_be_bytes()).await.unwrap();
            }
            s.shutdown().await.unwrap();
            // Keep the mux alive until the peer has drained everything.
            let mut sink = Vec::new();
            s.read_to_end(&mut sink).await.unwrap();
            client
        });
        let incoming = server.accept_stream().await.unwrap();
        assert_eq!(incoming.link().as_ref(), b"link");
        let mut s = incoming.accept().unwrap();
        for i in 0..100_u32 {
            let mut buf = [0_u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(u32::from_be_bytes(buf), i);
        }
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        s.shutdown().await.unwrap();
        open.await.unwrap();
    }

    #[tokio::test]
    async fn payloads_larger_than_a_frame_survive() {
        let (client, server) = pair();
        let blob = vec![0x5a_u8; frame::MAX_PAYLOAD * 3 + 17];
        let expected = blob.clone();
        let open = tokio::spawn(async move {
            let mut s = client.new_stream(Bytes::new()).await.unwrap();
            s.write_all(&blob).await.unwrap();
            s.shutdown().await.unwrap();
            let mut sink = Vec::new();
            s.read_to_end(&mut sink).await.unwrap();
            client
        });
        let mut s = server.accept_stream().await.unwrap().accept().unwrap();
        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        drop(s);
        open.await.unwrap();
    }

    #[tokio::test]
    async fn closing_one_stream_leaves_the_other_alone() {
        let (client, server) = pair();
        let srv = tokio::spawn(async move {
            let a = server.accept_stream().await.unwrap().accept().unwrap();
            let b = server.accept_stream().await.unwrap().accept().unwrap();
            (a, b, server)
        });
        let mut s1 = client.new_stream(Bytes::new()).await.unwrap();
        let mut s2 = client.new_stream(Bytes::new()).await.unwrap();
        s2.write_all(b"queued bytes").await.unwrap();
        s2.flush().await.unwrap();
        drop(s1);
        s2.write_all(b" and more").await.unwrap();
        s2.shutdown().await.unwrap();
        let (mut a, mut b, _server) = srv.await.unwrap();
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"queued bytes and more");
        // The dropped stream reads EOF on the peer.
        let mut buf = Vec::new();
        a.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn rejected_stream_surfaces_the_reason() {
        let (client, server) = pair();
        let srv = tokio::spawn(async move {
            let incoming = server.accept_stream().await.unwrap();
            incoming.reject("no such target");
            server
        });
        let err = client.new_stream(Bytes::new()).await.unwrap_err();
        match err {
            Error::StreamRefused(reason) => assert_eq!(reason, "no such target"),
            other => panic!("unexpected error: {other}"),
        }
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn flow_control_round_trips_a_window_multiple() {
        let config = MuxConfig {
            keepalive_interval: None,
            rwnd: 16 * 1024,
            ..MuxConfig::default()
        };
        let (a, b) = tokio::io::duplex(4096);
        let client = Multiplexor::new(a, Role::Client, config);
        let server = Multiplexor::new(b, Role::Server, config);
        // 1 MiB through a 16 KiB window forces many WINDOW_UPDATE cycles.
        let blob = vec![0xa5_u8; 1 << 20];
        let expected_len = blob.len();
        let open = tokio::spawn(async move {
            let mut s = client.new_stream(Bytes::new()).await.unwrap();
            s.write_all(&blob).await.unwrap();
            s.shutdown().await.unwrap();
            let mut sink = Vec::new();
            s.read_to_end(&mut sink).await.unwrap();
            client
        });
        let mut s = server.accept_stream().await.unwrap().accept().unwrap();
        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), expected_len);
        assert!(got.iter().all(|&b| b == 0xa5));
        drop(s);
        open.await.unwrap();
    }

    /// Read one frame off a raw transport half.
    async fn read_raw_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Frame {
        let mut header = [0_u8; HEADER_LEN];
        rd.read_exact(&mut header).await.unwrap();
        let id = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let opcode = header[4];
        let len = usize::from(u16::from_be_bytes(header[5..7].try_into().unwrap()));
        let mut payload = vec![0_u8; len];
        rd.read_exact(&mut payload).await.unwrap();
        Frame::parse(id, opcode, Bytes::from(payload)).unwrap()
    }

    #[tokio::test]
    async fn duplicate_syn_tears_the_connection_down() {
        let (raw, muxed) = tokio::io::duplex(4096);
        let mux = Multiplexor::new(muxed, Role::Server, cfg());
        let (mut raw_rd, mut raw_wr) = tokio::io::split(raw);
        let syn = Frame::new_syn(7, 1024, Bytes::new()).finalize();
        raw_wr.write_all(syn.as_bytes()).await.unwrap();
        raw_wr.write_all(syn.as_bytes()).await.unwrap();
        raw_wr.flush().await.unwrap();
        // First SYN is accepted; duplicate draws RST and a transport close.
        let first = mux.accept_stream().await.unwrap();
        assert_eq!(first.flow_id(), 7);
        let mut saw_rst = false;
        let mut raw = Vec::new();
        // Drain until the mux shuts the transport.
        loop {
            let mut buf = [0_u8; 256];
            match raw_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
            }
        }
        let mut rest = Bytes::from(raw);
        while rest.len() >= HEADER_LEN {
            let header: [u8; HEADER_LEN] = rest[..HEADER_LEN].try_into().unwrap();
            let _ = rest.split_to(HEADER_LEN);
            let len = usize::from(u16::from_be_bytes(header[5..7].try_into().unwrap()));
            let payload = rest.split_to(len.min(rest.len()));
            if let Ok(f) = Frame::parse(
                u32::from_be_bytes(header[0..4].try_into().unwrap()),
                header[4],
                payload,
            ) {
                if f.payload.opcode() == OpCode::Rst && f.id == 7 {
                    saw_rst = true;
                }
            }
        }
        assert!(saw_rst);
        // The mux is dead: further accepts fail.
        assert!(matches!(mux.accept_stream().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn data_for_unknown_stream_is_dropped_silently() {
        let (raw, muxed) = tokio::io::duplex(4096);
        let mux = Multiplexor::new(muxed, Role::Server, cfg());
        let (mut raw_rd, mut raw_wr) = tokio::io::split(raw);
        let stray = Frame::new_data(99, Bytes::from_static(b"late")).finalize();
        raw_wr.write_all(stray.as_bytes()).await.unwrap();
        // The connection must survive: a SYN afterwards still works.
        let syn = Frame::new_syn(1, 1024, Bytes::from_static(b"x")).finalize();
        raw_wr.write_all(syn.as_bytes()).await.unwrap();
        raw_wr.flush().await.unwrap();
        let incoming = mux.accept_stream().await.unwrap();
        let _stream = incoming.accept().unwrap();
        let reply = read_raw_frame(&mut raw_rd).await;
        assert_eq!(reply.payload.opcode(), OpCode::ConnSuccess);
        assert_eq!(reply.id, 1);
    }
}
