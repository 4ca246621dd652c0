//! Transport abstraction: dial and listen over tcp, kcp, ws, wss or tls,
//! all surfacing as ordered byte streams.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::tls;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, warn};

/// The transports a bridge connection can ride on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Kcp,
    Ws,
    Wss,
    Tls,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] tls::Error),
    #[error("WebSocket handshake failed: {0}")]
    Ws(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid address {0}")]
    InvalidAddr(String),
    #[error("{kind:?} listener requires a TLS certificate and key")]
    MissingTls { kind: TransportKind },
}

/// Object-safe byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connection to or from a peer, transport erased.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Host portion of a `host:port` string, brackets stripped.
fn host_part(addr: &str) -> Result<&str, Error> {
    let (host, _) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddr(addr.to_string()))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']'))
}

/// Dial a bridge. The address is `host:port`; ws/wss derive the URL from
/// it.
pub async fn dial(
    kind: TransportKind,
    addr: &str,
    tls_skip_verify: bool,
) -> Result<BoxedStream, Error> {
    match kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        TransportKind::Kcp => {
            let peer: SocketAddr = tokio::net::lookup_host(addr)
                .await?
                .next()
                .ok_or_else(|| Error::InvalidAddr(addr.to_string()))?;
            let stream = KcpStream::connect(&KcpConfig::default(), peer)
                .await
                .map_err(io::Error::other)?;
            Ok(Box::new(stream))
        }
        TransportKind::Tls => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true).ok();
            let config = tls::make_client_config(tls_skip_verify);
            let connector = TlsConnector::from(Arc::new(config));
            let name = rustls::pki_types::ServerName::try_from(host_part(addr)?.to_string())
                .map_err(|_| Error::InvalidAddr(addr.to_string()))?;
            Ok(Box::new(connector.connect(name, stream).await?))
        }
        TransportKind::Ws | TransportKind::Wss => {
            let scheme = if kind == TransportKind::Ws { "ws" } else { "wss" };
            let url = format!("{scheme}://{addr}/");
            let connector = if kind == TransportKind::Wss {
                Some(Connector::Rustls(Arc::new(tls::make_client_config(
                    tls_skip_verify,
                ))))
            } else {
                Some(Connector::Plain)
            };
            let (ws, _response) =
                tokio_tungstenite::connect_async_tls_with_config(url, None, true, connector)
                    .await
                    .map_err(Box::new)?;
            debug!("WebSocket handshake succeeded");
            Ok(Box::new(WsByteStream::new(ws)))
        }
    }
}

/// A bound bridge listener.
pub enum Listener {
    Tcp {
        listener: TcpListener,
        kind: TransportKind,
        acceptor: Option<TlsAcceptor>,
    },
    Kcp(KcpListener),
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { kind, .. } => f.debug_struct("Listener").field("kind", kind).finish(),
            Self::Kcp(_) => f.debug_struct("Listener").field("kind", &"kcp").finish(),
        }
    }
}

/// Bind a listener for the given transport. `tls` supplies the PEM cert
/// and key paths for `tls` and `wss`.
pub async fn listen(
    kind: TransportKind,
    bind: SocketAddr,
    tls_files: Option<(&str, &str)>,
) -> Result<Listener, Error> {
    match kind {
        TransportKind::Kcp => {
            let listener = KcpListener::bind(KcpConfig::default(), bind)
                .await
                .map_err(io::Error::other)?;
            Ok(Listener::Kcp(listener))
        }
        _ => {
            let acceptor = match kind {
                TransportKind::Tls | TransportKind::Wss => {
                    let (cert, key) = tls_files.ok_or(Error::MissingTls { kind })?;
                    let config = tls::make_server_config(cert, key).await?;
                    Some(TlsAcceptor::from(Arc::new(config)))
                }
                _ => None,
            };
            let listener = TcpListener::bind(bind).await?;
            Ok(Listener::Tcp {
                listener,
                kind,
                acceptor,
            })
        }
    }
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp { listener, .. } => listener.local_addr(),
            Self::Kcp(listener) => listener.local_addr().map_err(io::Error::other),
        }
    }

    /// Accept one connection. Per-connection handshakes (TLS, WebSocket)
    /// are deferred into [`Pending::establish`] so a slow peer cannot
    /// stall the accept loop.
    pub async fn accept(&mut self) -> Result<(Pending, SocketAddr), Error> {
        match self {
            Self::Tcp {
                listener,
                kind,
                acceptor,
            } => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((
                    Pending::Tcp {
                        stream,
                        kind: *kind,
                        acceptor: acceptor.clone(),
                    },
                    peer,
                ))
            }
            Self::Kcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(io::Error::other)?;
                Ok((Pending::Ready(Box::new(stream)), peer))
            }
        }
    }
}

/// An accepted connection whose transport handshake has not run yet.
pub enum Pending {
    Ready(BoxedStream),
    Tcp {
        stream: TcpStream,
        kind: TransportKind,
        acceptor: Option<TlsAcceptor>,
    },
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pending")
    }
}

impl Pending {
    /// Run the per-connection handshake and return the byte stream.
    pub async fn establish(self) -> Result<BoxedStream, Error> {
        match self {
            Self::Ready(stream) => Ok(stream),
            Self::Tcp {
                stream,
                kind,
                acceptor,
            } => match kind {
                TransportKind::Tcp | TransportKind::Kcp => Ok(Box::new(stream)),
                TransportKind::Tls => {
                    let acceptor = acceptor.expect("TLS listener has an acceptor (this is a bug)");
                    Ok(Box::new(acceptor.accept(stream).await?))
                }
                TransportKind::Ws => {
                    let ws = tokio_tungstenite::accept_async(stream).await.map_err(Box::new)?;
                    Ok(Box::new(WsByteStream::new(ws)))
                }
                TransportKind::Wss => {
                    let acceptor = acceptor.expect("WSS listener has an acceptor (this is a bug)");
                    let tls_stream = acceptor.accept(stream).await?;
                    let ws = tokio_tungstenite::accept_async(tls_stream)
                        .await
                        .map_err(Box::new)?;
                    Ok(Box::new(WsByteStream::new(ws)))
                }
            },
        }
    }
}

/// Presents a binary WebSocket as an ordered byte stream. Each write
/// becomes one binary message; received messages are buffered and drained
/// byte-wise.
#[derive(Debug)]
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    read_eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            read_eof: false,
        }
    }
}

fn ws_io_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::ErrorKind::BrokenPipe.into()
        }
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncRead for WsByteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                let chunk = self.read_buf.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => self.read_buf = data,
                Some(Ok(Message::Text(text))) => {
                    // Tolerated: peers should only send binary.
                    self.read_buf = Bytes::copy_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                // Ping/Pong replies are handled by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket read failed: {e}");
                    return Poll::Ready(Err(ws_io_err(e)));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_io_err)?;
        self.inner
            .start_send_unpin(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_io_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.inner.poll_close_unpin(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_io_err(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_dial_and_listen_roundtrip() {
        let mut listener = listen(
            TransportKind::Tcp,
            "127.0.0.1:0".parse().unwrap(),
            None,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (pending, _) = listener.accept().await.unwrap();
            let mut stream = pending.establish().await.unwrap();
            let mut buf = [0_u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });
        let mut client = dial(TransportKind::Tcp, &addr.to_string(), false)
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0_u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ws_dial_and_listen_roundtrip() {
        let mut listener = listen(
            TransportKind::Ws,
            "127.0.0.1:0".parse().unwrap(),
            None,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (pending, _) = listener.accept().await.unwrap();
            let mut stream = pending.establish().await.unwrap();
            let mut buf = vec![0_u8; 9];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"two\nreads");
            stream.write_all(b"reply").await.unwrap();
            stream.flush().await.unwrap();
        });
        let mut client = dial(TransportKind::Ws, &addr.to_string(), false)
            .await
            .unwrap();
        // Message boundaries must not leak through the byte-stream view.
        client.write_all(b"two\n").await.unwrap();
        client.write_all(b"reads").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0_u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
        server.await.unwrap();
    }
}
