//! HTTP front-ends: the shared host-routed reverse proxy port and
//! per-tunnel HTTP forward proxies (including CONNECT).
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{open_stream_for_tunnel, BridgeCtx, ClientHandle, Error, TunnelHandle};
use crate::codec::{ChunkReader, ChunkWriter, CodecSpec};
use crate::http_head::{self, read_head, RequestHead};
use crate::protocol::ConnType;
use crate::relay::{relay, RelayOpts};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use warren_mux::MuxStream;

const NOT_FOUND_PAGE: &str =
    "<html><head><title>404 Not Found</title></head><body><h1>404 Not Found</h1></body></html>";

fn not_found_response() -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        NOT_FOUND_PAGE.len(),
        NOT_FOUND_PAGE
    ))
}

/// The shared listener that routes by `Host` header across every
/// `hostProxy` tunnel.
pub(super) async fn serve_host_proxy(
    ctx: Arc<BridgeCtx>,
    addr: SocketAddr,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "host proxy listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_host_conn(ctx, stream, peer).await {
                debug!("host proxy connection from {peer} ended: {e}");
            }
        });
    }
}

/// One upstream binding on a keep-alive connection.
struct Upstream {
    host: String,
    writer: ChunkWriter<WriteHalf<MuxStream>>,
    client: Arc<ClientHandle>,
    tunnel: Arc<TunnelHandle>,
}

async fn handle_host_conn(
    ctx: Arc<BridgeCtx>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    let (mut rd, wr) = stream.into_split();
    let wr = Arc::new(Mutex::new(wr));
    let mut buf = BytesMut::new();
    let mut upstream: Option<Upstream> = None;
    while let Some(head) = read_head(&mut rd, &mut buf).await.map_err(io_like)? {
        let source = head.forwarded_source(&peer.to_string());
        info!(
            method = %head.method,
            host = %head.host,
            url = %head.target,
            forwarded_for = %source,
            "host proxy request"
        );
        let Some(tunnel) = ctx.dispatcher.by_host(&head.host) else {
            wr.lock().await.write_all(&not_found_response()).await?;
            if head.keep_alive {
                continue;
            }
            break;
        };
        // A host change mid-connection would interleave two upstreams on
        // one client socket; close instead and let the client reconnect.
        if upstream.as_ref().is_some_and(|u| u.host != head.host) {
            break;
        }
        if upstream.is_none() {
            let target = tunnel
                .targets
                .select()
                .ok_or(Error::NoTarget(tunnel.record.id))?;
            let (mux_stream, spec, client) = open_stream_for_tunnel(
                &ctx,
                &tunnel,
                ConnType::Http,
                target,
                peer.to_string(),
            )
            .await?;
            let (stream_rd, stream_wr) = tokio::io::split(mux_stream);
            spawn_response_pump(
                ChunkReader::new(stream_rd, spec),
                wr.clone(),
                tunnel.clone(),
                client.clone(),
            );
            upstream = Some(Upstream {
                host: head.host.clone(),
                writer: ChunkWriter::new(stream_wr, spec),
                client,
                tunnel,
            });
        }
        let up = upstream.as_mut().expect("upstream bound above (this is a bug)");
        forward_request(&mut rd, &mut buf, up, &head, &peer).await?;
        if !head.keep_alive {
            break;
        }
    }
    if let Some(mut up) = upstream {
        up.writer.shutdown().await.ok();
    }
    Ok(())
}

/// Forward one parsed request (head + body) upstream.
async fn forward_request(
    rd: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    up: &mut Upstream,
    head: &RequestHead,
    peer: &SocketAddr,
) -> Result<(), Error> {
    let serialized = head.serialize(Some(&peer.ip().to_string()), None);
    up.client.rate.acquire(serialized.len()).await;
    up.writer.write_chunk(&serialized).await.map_err(relay_err)?;
    account(up, serialized.len() as u64, 0)?;
    forward_request_body(rd, buf, up, head).await
}

/// Blind source → upstream copy for request framings we do not parse.
async fn pipe_remaining(
    rd: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    up: &mut Upstream,
) -> Result<(), Error> {
    if !buf.is_empty() {
        let piece = buf.split();
        up.writer.write_chunk(&piece).await.map_err(relay_err)?;
        account(up, piece.len() as u64, 0)?;
    }
    let mut chunk = vec![0_u8; crate::config::BUFFER_SIZE];
    loop {
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        up.client.rate.acquire(n).await;
        up.writer.write_chunk(&chunk[..n]).await.map_err(relay_err)?;
        account(up, n as u64, 0)?;
    }
}

/// Target → user copy; responses are not parsed.
fn spawn_response_pump(
    mut reader: ChunkReader<ReadHalf<MuxStream>>,
    wr: Arc<Mutex<OwnedWriteHalf>>,
    tunnel: Arc<TunnelHandle>,
    client: Arc<ClientHandle>,
) {
    tokio::spawn(async move {
        loop {
            match reader.read_chunk().await {
                Ok(Some(data)) => {
                    let mut wr = wr.lock().await;
                    if wr.write_all(&data).await.is_err() {
                        break;
                    }
                    let quota = tunnel.flow.add(0, data.len() as u64).is_err()
                        || client.flow.add(0, data.len() as u64).is_err();
                    if quota {
                        debug!("quota exceeded on response path");
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        if let Ok(mut wr) = wr.try_lock() {
            wr.shutdown().await.ok();
        }
    });
}

/// An `httpProxy` tunnel: a forward proxy on its own port.
pub(super) async fn serve_http_proxy(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(ctx.bind_addr(tunnel.record.port)).await?;
    info!(
        tunnel = tunnel.record.id,
        addr = %listener.local_addr()?,
        "http proxy listening"
    );
    ctx.sink.tunnel_bound(tunnel.record.id, tunnel.record.port);
    let mut shutdown = tunnel.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(tunnel = tunnel.record.id, "http proxy unbound");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true).ok();
                let ctx = ctx.clone();
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_proxy_conn(ctx, tunnel, stream, peer).await {
                        debug!("http proxy connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_proxy_conn(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    if tunnel.flow.exhausted() {
        return Err(Error::Relay(crate::relay::Error::Quota));
    }
    let (mut rd, wr) = stream.into_split();
    let mut buf = BytesMut::new();
    let Some(head) = read_head(&mut rd, &mut buf).await.map_err(io_like)? else {
        return Ok(());
    };
    let source = head.forwarded_source(&peer.to_string());
    info!(
        method = %head.method,
        host = %head.host,
        url = %head.target,
        forwarded_for = %source,
        "proxy request"
    );
    if head.method.eq_ignore_ascii_case("CONNECT") {
        // HTTPS tunneling: acknowledge, then go blind both ways.
        let target = http_head::with_default_port(&head.target, 443);
        let (mux_stream, spec, client) =
            open_stream_for_tunnel(&ctx, &tunnel, ConnType::Tcp, target, peer.to_string()).await?;
        let mut wr = wr;
        wr.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        let stream = rd
            .reunite(wr)
            .expect("halves from the same stream (this is a bug)");
        let opts = RelayOpts {
            rate: Some(client.rate.clone()),
            flow: Some(tunnel.flow.clone()),
            client_flow: Some(client.flow.clone()),
            filter: None,
            preface: (!buf.is_empty()).then(|| buf.freeze()),
        };
        relay(stream, mux_stream, CodecSpec::default(), spec, opts).await?;
        return Ok(());
    }
    // Plain proxying: rewrite to origin form, route by the request target.
    let (authority, path) = http_head::split_absolute_target(&head);
    let target = http_head::with_default_port(&authority, 80);
    let (mux_stream, spec, client) =
        open_stream_for_tunnel(&ctx, &tunnel, ConnType::Http, target.clone(), peer.to_string())
            .await?;
    let wr = Arc::new(Mutex::new(wr));
    let (stream_rd, stream_wr) = tokio::io::split(mux_stream);
    spawn_response_pump(
        ChunkReader::new(stream_rd, spec),
        wr.clone(),
        tunnel.clone(),
        client.clone(),
    );
    let mut up = Upstream {
        host: authority.clone(),
        writer: ChunkWriter::new(stream_wr, spec),
        client,
        tunnel,
    };
    // First request uses the rewritten target.
    let serialized = head.serialize(Some(&peer.ip().to_string()), Some(&path));
    up.client.rate.acquire(serialized.len()).await;
    up.writer.write_chunk(&serialized).await.map_err(relay_err)?;
    account(&up, serialized.len() as u64, 0)?;
    forward_request_body(&mut rd, &mut buf, &mut up, &head).await?;
    // Subsequent keep-alive requests must aim at the same authority.
    if head.keep_alive {
        while let Some(next) = read_head(&mut rd, &mut buf).await.map_err(io_like)? {
            let (next_authority, next_path) = http_head::split_absolute_target(&next);
            if http_head::with_default_port(&next_authority, 80) != target {
                break;
            }
            info!(
                method = %next.method,
                host = %next.host,
                url = %next.target,
                "proxy request"
            );
            let serialized = next.serialize(Some(&peer.ip().to_string()), Some(&next_path));
            up.client.rate.acquire(serialized.len()).await;
            up.writer.write_chunk(&serialized).await.map_err(relay_err)?;
            account(&up, serialized.len() as u64, 0)?;
            forward_request_body(&mut rd, &mut buf, &mut up, &next).await?;
            if !next.keep_alive {
                break;
            }
        }
    }
    up.writer.shutdown().await.ok();
    Ok(())
}

async fn forward_request_body(
    rd: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    up: &mut Upstream,
    head: &RequestHead,
) -> Result<(), Error> {
    if head.chunked {
        // Framing we do not track: degrade to a blind pipe.
        trace!("chunked request, degrading to blind copy");
        pipe_remaining(rd, buf, up).await?;
        return Ok(());
    }
    let mut remaining = head.content_length.unwrap_or(0);
    while remaining > 0 {
        if buf.is_empty() {
            let mut chunk = vec![0_u8; (remaining as usize).min(8 * 1024)];
            let n = rd.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let take = (remaining as usize).min(buf.len());
        let piece = buf.split_to(take);
        up.client.rate.acquire(piece.len()).await;
        up.writer.write_chunk(&piece).await.map_err(relay_err)?;
        account(up, piece.len() as u64, 0)?;
        remaining -= take as u64;
    }
    Ok(())
}

fn account(up: &Upstream, inbound: u64, outbound: u64) -> Result<(), Error> {
    up.tunnel
        .flow
        .add(inbound, outbound)
        .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
    up.client
        .flow
        .add(inbound, outbound)
        .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
    Ok(())
}

fn relay_err(e: crate::codec::Error) -> Error {
    Error::Relay(crate::relay::Error::Codec(e))
}

fn io_like(e: crate::http_head::Error) -> Error {
    match e {
        crate::http_head::Error::Io(e) => Error::Io(e),
        other => Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string())),
    }
}
