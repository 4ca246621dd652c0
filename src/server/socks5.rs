//! SOCKS5 tunnel listener: RFC 1928 greeting and requests, CONNECT and
//! UDP ASSOCIATE. Target names are shipped as-is; the client resolves.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{open_stream_for_tunnel, BridgeCtx, Error, TunnelHandle};
use crate::codec::{self, CodecSpec};
use crate::config::UDP_SESSION_TIMEOUT;
use crate::protocol::{read_block, write_block, ConnType, UdpDatagram};
use crate::relay::{relay, RelayOpts};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, trace};

#[derive(Debug, thiserror::Error)]
enum SocksError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("client with version={0} is not SOCKSv5")]
    Version(u8),
    #[error("unsupported SOCKS command {0}")]
    Command(u8),
    #[error("invalid address type {0}")]
    AddressType(u8),
    #[error("no acceptable authentication method")]
    NoAuth,
    #[error("bad credentials")]
    BadCredentials,
    #[error(transparent)]
    Bridge(#[from] Box<Error>),
}

pub(super) async fn serve(ctx: Arc<BridgeCtx>, tunnel: Arc<TunnelHandle>) -> Result<(), Error> {
    let listener = TcpListener::bind(ctx.bind_addr(tunnel.record.port)).await?;
    info!(
        tunnel = tunnel.record.id,
        addr = %listener.local_addr()?,
        "socks5 tunnel listening"
    );
    ctx.sink.tunnel_bound(tunnel.record.id, tunnel.record.port);
    let mut shutdown = tunnel.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(tunnel = tunnel.record.id, "socks5 tunnel unbound");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let ctx = ctx.clone();
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, tunnel, stream, peer).await {
                        debug!("socks5 connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SocksError> {
    let version = stream.read_u8().await?;
    if version != 5 {
        return Err(SocksError::Version(version));
    }
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0_u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    // A source IP registered via `RGST` skips username/password.
    let registered = ctx
        .registry
        .get(&tunnel.client_digest)
        .is_some_and(|client| client.ip_registered(peer.ip()));
    let want_auth = !tunnel.record.socks_user.is_empty() && !registered;
    if want_auth {
        if !methods.contains(&0x02) {
            stream.write_all(&[0x05, 0xff]).await?;
            return Err(SocksError::NoAuth);
        }
        stream.write_all(&[0x05, 0x02]).await?;
        authenticate(&mut stream, &tunnel).await?;
    } else {
        if !methods.contains(&0x00) {
            stream.write_all(&[0x05, 0xff]).await?;
            return Err(SocksError::NoAuth);
        }
        stream.write_all(&[0x05, 0x00]).await?;
    }

    let (command, host, port) = read_request(&mut stream).await?;
    trace!(command, host = %host, port, "socks5 request");
    match command {
        // CONNECT
        0x01 => {
            let target = format!("{host}:{port}");
            let opened = open_stream_for_tunnel(
                &ctx,
                &tunnel,
                ConnType::Tcp,
                target,
                peer.to_string(),
            )
            .await;
            let (mux_stream, spec, client) = match opened {
                Ok(parts) => parts,
                Err(e) => {
                    write_response(&mut stream, 0x05, None).await?;
                    return Err(SocksError::Bridge(Box::new(e)));
                }
            };
            write_response(&mut stream, 0x00, None).await?;
            let opts = RelayOpts {
                rate: Some(client.rate.clone()),
                flow: Some(tunnel.flow.clone()),
                client_flow: Some(client.flow.clone()),
                filter: None,
                preface: None,
            };
            relay(stream, mux_stream, CodecSpec::default(), spec, opts)
                .await
                .map_err(|e| SocksError::Bridge(Box::new(Error::Relay(e))))?;
            Ok(())
        }
        // UDP ASSOCIATE
        0x03 => {
            let bind_ip = match peer.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            let socket = UdpSocket::bind((bind_ip, 0)).await?;
            let local = socket.local_addr()?;
            write_response(&mut stream, 0x00, Some(local)).await?;
            let relay_task = tokio::spawn(udp_associate(ctx, tunnel, socket, peer));
            // The association lives as long as the TCP control connection.
            stream.read(&mut [0_u8; 1]).await.ok();
            relay_task.abort();
            Ok(())
        }
        other => {
            write_response(&mut stream, 0x07, None).await?;
            Err(SocksError::Command(other))
        }
    }
}

async fn authenticate(stream: &mut TcpStream, tunnel: &TunnelHandle) -> Result<(), SocksError> {
    // RFC 1929 username/password subnegotiation.
    let _ver = stream.read_u8().await?;
    let ulen = stream.read_u8().await?;
    let mut user = vec![0_u8; usize::from(ulen)];
    stream.read_exact(&mut user).await?;
    let plen = stream.read_u8().await?;
    let mut pass = vec![0_u8; usize::from(plen)];
    stream.read_exact(&mut pass).await?;
    let ok = user == tunnel.record.socks_user.as_bytes()
        && pass == tunnel.record.socks_password.as_bytes();
    stream.write_all(&[0x01, u8::from(!ok)]).await?;
    if ok {
        Ok(())
    } else {
        Err(SocksError::BadCredentials)
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<(u8, String, u16), SocksError> {
    let version = stream.read_u8().await?;
    if version != 5 {
        return Err(SocksError::Version(version));
    }
    let command = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;
    let atyp = stream.read_u8().await?;
    let host = match atyp {
        0x01 => {
            let mut octets = [0_u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await?;
            let mut name = vec![0_u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut octets = [0_u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => return Err(SocksError::AddressType(other)),
    };
    let port = stream.read_u16().await?;
    Ok((command, host, port))
}

async fn write_response(
    stream: &mut TcpStream,
    code: u8,
    bind: Option<SocketAddr>,
) -> Result<(), SocksError> {
    let mut reply = vec![0x05, code, 0x00];
    match bind {
        Some(SocketAddr::V4(addr)) => {
            reply.push(0x01);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.push(0x04);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(0x01);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Ship SOCKS UDP datagrams between the user's socket and a dedicated
/// `udp5` stream. Targets come from each datagram's own header.
async fn udp_associate(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    socket: UdpSocket,
    peer: SocketAddr,
) -> Result<(), Error> {
    let (stream, spec, client) = open_stream_for_tunnel(
        &ctx,
        &tunnel,
        ConnType::Udp5,
        String::new(),
        peer.to_string(),
    )
    .await?;
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let mut user_addr: Option<SocketAddr> = None;
    let mut buf = vec![0_u8; 65536];
    loop {
        tokio::select! {
            received = tokio::time::timeout(UDP_SESSION_TIMEOUT, socket.recv_from(&mut buf)) => {
                let Ok(received) = received else { return Ok(()) };
                let (len, from) = received?;
                // Only the associating peer's datagrams are relayed.
                if from.ip() != peer.ip() {
                    continue;
                }
                user_addr = Some(from);
                let Ok(datagram) = UdpDatagram::decode(&buf[..len]) else {
                    continue;
                };
                let sealed = codec::seal(&spec, &datagram.encode())
                    .map_err(|e| Error::Relay(crate::relay::Error::Codec(e)))?;
                client.rate.acquire(sealed.len()).await;
                write_block(&mut stream_wr, &sealed).await?;
                tunnel.flow.add(sealed.len() as u64, 0)
                    .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
            }
            block = read_block(&mut stream_rd) => {
                let Ok(block) = block else { return Ok(()) };
                let datagram = UdpDatagram::decode(
                    &codec::open(&spec, &block)
                        .map_err(|e| Error::Relay(crate::relay::Error::Codec(e)))?,
                )
                .map_err(Error::Protocol)?;
                if let Some(user) = user_addr {
                    socket.send_to(&datagram.encode(), user).await?;
                    tunnel.flow.add(0, datagram.data.len() as u64)
                        .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
                }
            }
        }
    }
}
