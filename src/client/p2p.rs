//! P2P direct paths: rendezvous punching, the provider's KCP acceptor and
//! the visitor's local forwarder.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{handle_stream, ClientOptions, Error};
use crate::codec::CodecSpec;
use crate::config::{P2pVisitorConfig, DIAL_TIMEOUT, P2P_BUCKET_SECS};
use crate::protocol::{
    self, key_digest, read_json, write_block, write_tag, ConnType, LinkInfo, NewUdpRequest,
    RendezvousReply, Tag,
};
use crate::relay::{relay, RelayOpts};
use crate::transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use warren_mux::{MuxConfig, Multiplexor, Role};

/// The bucketed match token both sides hand the broker. Rotates every
/// 100 seconds; around the boundary the sides can briefly disagree.
fn match_key(password: &str) -> String {
    let bucket = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after the epoch (this is a bug)")
        .as_secs()
        / P2P_BUCKET_SECS;
    key_digest(&format!("{password}{bucket}"))
}

/// A rendezvous address of `0.0.0.0` means "same host as the bridge".
fn fix_unspecified(rendezvous: &str, server: &str) -> String {
    match rendezvous.strip_prefix("0.0.0.0:") {
        Some(port) => {
            let host = server.rsplit_once(':').map_or(server, |(h, _)| h);
            format!("{host}:{port}")
        }
        None => rendezvous.to_string(),
    }
}

/// Ask the broker for the peer's observed address, retrying across lost
/// datagrams.
async fn punch_rendezvous(
    socket: &UdpSocket,
    rendezvous: &str,
    tag: Tag,
    key: &str,
) -> io::Result<SocketAddr> {
    let mut msg = Vec::with_capacity(4 + key.len());
    msg.extend_from_slice(&tag.wire());
    msg.extend_from_slice(key.as_bytes());
    let mut buf = [0_u8; 128];
    for attempt in 0..10 {
        socket.send_to(&msg, rendezvous).await?;
        match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                if let Ok(addr) = String::from_utf8_lossy(&buf[..n]).parse() {
                    return Ok(addr);
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => trace!(attempt, "rendezvous timed out, retrying"),
        }
    }
    Err(io::ErrorKind::TimedOut.into())
}

/// Open the NAT mapping towards the peer. Best-effort: an unconfirmed
/// punch still lets the KCP handshake try.
async fn hole_punch(socket: &UdpSocket, peer: SocketAddr) -> io::Result<()> {
    let mut buf = [0_u8; 64];
    for _ in 0..8 {
        socket.send_to(b"punch", peer).await?;
        if let Ok(Ok((_, from))) =
            tokio::time::timeout(Duration::from_millis(250), socket.recv_from(&mut buf)).await
        {
            if from == peer {
                // One more so the peer also sees us.
                socket.send_to(b"punch", peer).await?;
                debug!(%peer, "hole punched");
                return Ok(());
            }
        }
    }
    debug!(%peer, "punch unconfirmed");
    Ok(())
}

/// Provider side, triggered by `NUDP` on the signal channel: punch, then
/// accept a KCP session from the visitor and serve streams off it.
pub(super) async fn provider(
    opts: ClientOptions,
    req: NewUdpRequest,
    cache: Arc<Mutex<HashMap<String, SocketAddr>>>,
) {
    if let Err(e) = provider_inner(&opts, &req, &cache).await {
        warn!("p2p provider session failed: {e}");
    }
}

async fn provider_inner(
    opts: &ClientOptions,
    req: &NewUdpRequest,
    cache: &Mutex<HashMap<String, SocketAddr>>,
) -> Result<(), Error> {
    let key = match_key(&req.password);
    let rendezvous = fix_unspecified(&req.rendezvous, &opts.server);
    // The local port stays pinned within a bucket so both rendezvous
    // attempts in quick succession punch from the same mapping.
    let cached = cache.lock().get(&key).copied();
    let socket = match cached {
        Some(addr) => match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(_) => UdpSocket::bind(("0.0.0.0", 0)).await?,
        },
        None => UdpSocket::bind(("0.0.0.0", 0)).await?,
    };
    let local = socket.local_addr()?;
    cache.lock().insert(key.clone(), local);
    let peer = punch_rendezvous(&socket, &rendezvous, Tag::P2pProvider, &key).await?;
    info!(%peer, "visitor address received");
    hole_punch(&socket, peer).await?;
    // Hand the punched port over to KCP.
    drop(socket);
    let mut listener = tokio_kcp::KcpListener::bind(tokio_kcp::KcpConfig::default(), local)
        .await
        .map_err(io::Error::other)?;
    let (stream, from) = tokio::time::timeout(DIAL_TIMEOUT, listener.accept())
        .await
        .map_err(|_| Error::DialTimeout)?
        .map_err(io::Error::other)?;
    if from.ip() != peer.ip() {
        warn!(%from, "kcp session from an unexpected address, dropping");
        return Ok(());
    }
    info!(%from, "direct kcp session established");
    let mux = Multiplexor::new(stream, Role::Server, MuxConfig::default());
    loop {
        let incoming = mux.accept_stream().await?;
        let verify_key = opts.verify_key.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(verify_key, incoming).await {
                debug!("p2p stream ended: {e}");
            }
        });
    }
}

/// Visitor side: a local TCP port whose connections ride the direct KCP
/// path to the provider's target.
pub(super) async fn visitor(
    opts: ClientOptions,
    config: P2pVisitorConfig,
    mut stop: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(("0.0.0.0", config.local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("cannot bind p2p visitor port {}: {e}", config.local_port);
            return;
        }
    };
    info!(port = config.local_port, "p2p visitor listening");
    let mut mux: Option<Arc<Multiplexor>> = None;
    loop {
        let conn = tokio::select! {
            _ = stop.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!("p2p visitor accept failed: {e}");
                    return;
                }
            },
        };
        if mux.as_ref().map_or(true, |m| m.is_closed()) {
            match establish(&opts, &config).await {
                Ok(established) => mux = Some(Arc::new(established)),
                Err(e) => {
                    warn!("p2p session setup failed: {e}");
                    continue;
                }
            }
        }
        let mux = mux.as_ref().expect("established above (this is a bug)").clone();
        let target = config.target.clone();
        tokio::spawn(async move {
            let link = LinkInfo {
                conn_type: ConnType::Tcp,
                host: target,
                crypt: false,
                compress: false,
                remote_addr: String::new(),
                proxy_protocol: Default::default(),
                timeout_secs: None,
            };
            let stream = match mux.new_stream(link.encode()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("p2p stream open failed: {e}");
                    return;
                }
            };
            if let Err(e) = relay(
                conn,
                stream,
                CodecSpec::default(),
                CodecSpec::default(),
                RelayOpts::default(),
            )
            .await
            {
                debug!("p2p visitor stream ended: {e}");
            }
        });
    }
}

/// Set up the direct path: ask the bridge for the broker, punch, connect
/// KCP to the provider.
async fn establish(
    opts: &ClientOptions,
    config: &P2pVisitorConfig,
) -> Result<Multiplexor, Error> {
    let mut conn = tokio::time::timeout(
        DIAL_TIMEOUT,
        transport::dial(opts.transport, &opts.server, opts.tls_skip_verify),
    )
    .await
    .map_err(|_| Error::DialTimeout)??;
    protocol::client_handshake(&mut conn, &opts.verify_key).await?;
    write_tag(&mut conn, Tag::P2pVisitor).await?;
    write_block(&mut conn, key_digest(&config.password).as_bytes()).await?;
    let reply: RendezvousReply = read_json(&mut conn).await?;
    drop(conn);
    let rendezvous = fix_unspecified(&reply.rendezvous, &opts.server);
    debug!(%rendezvous, "rendezvous broker assigned");
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let key = match_key(&config.password);
    let peer = punch_rendezvous(&socket, &rendezvous, Tag::P2pVisitor, &key).await?;
    info!(%peer, "provider address received");
    hole_punch(&socket, peer).await?;
    drop(socket);
    let stream = tokio::time::timeout(
        DIAL_TIMEOUT,
        tokio_kcp::KcpStream::connect(&tokio_kcp::KcpConfig::default(), peer),
    )
    .await
    .map_err(|_| Error::DialTimeout)?
    .map_err(io::Error::other)?;
    info!(%peer, "direct kcp session established");
    Ok(Multiplexor::new(stream, Role::Client, MuxConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_rendezvous_inherits_the_bridge_host() {
        assert_eq!(
            fix_unspecified("0.0.0.0:8025", "bridge.example:8024"),
            "bridge.example:8025"
        );
        assert_eq!(
            fix_unspecified("1.2.3.4:8025", "bridge.example:8024"),
            "1.2.3.4:8025"
        );
    }

    #[test]
    fn match_keys_agree_within_a_bucket() {
        // Two computations inside the same call are in the same bucket
        // almost always; the boundary race is inherited behavior.
        assert_eq!(match_key("p"), match_key("p"));
        assert_ne!(match_key("p"), match_key("q"));
    }
}
