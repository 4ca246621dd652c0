//! UDP tunnel listener: datagrams ride a logical stream as length-prefixed
//! SOCKS UDP envelopes, one stream per source address.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{open_stream_for_tunnel, BridgeCtx, Error, TunnelHandle};
use crate::codec::{self, CodecSpec};
use crate::config::UDP_SESSION_TIMEOUT;
use crate::protocol::{read_block, write_block, ConnType, UdpDatagram};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub(super) async fn serve(ctx: Arc<BridgeCtx>, tunnel: Arc<TunnelHandle>) -> Result<(), Error> {
    let socket = Arc::new(UdpSocket::bind(ctx.bind_addr(tunnel.record.port)).await?);
    info!(
        tunnel = tunnel.record.id,
        addr = %socket.local_addr()?,
        "udp tunnel listening"
    );
    ctx.sink.tunnel_bound(tunnel.record.id, tunnel.record.port);
    // At most one live stream per source address.
    let sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut shutdown = tunnel.shutdown_rx();
    let mut buf = vec![0_u8; 65536];
    loop {
        let (len, source) = tokio::select! {
            _ = shutdown.changed() => {
                info!(tunnel = tunnel.record.id, "udp tunnel unbound");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received?,
        };
        let data = Bytes::copy_from_slice(&buf[..len]);
        let existing = sessions.lock().get(&source).cloned();
        let tx = match existing {
            Some(tx) if !tx.is_closed() => tx,
            _ => {
                let (tx, rx) = mpsc::channel(64);
                sessions.lock().insert(source, tx.clone());
                let ctx = ctx.clone();
                let tunnel = tunnel.clone();
                let socket = socket.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_session(ctx, tunnel.clone(), socket, source, rx).await {
                        debug!("udp session for {source} ended: {e}");
                    }
                    sessions.lock().remove(&source);
                });
                tx
            }
        };
        // A full queue drops the datagram rather than stalling the socket.
        if tx.try_send(data).is_err() {
            trace!(%source, "udp session queue full, dropping datagram");
        }
    }
}

async fn run_session(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(), Error> {
    if tunnel.flow.exhausted() {
        return Err(Error::Relay(crate::relay::Error::Quota));
    }
    let target = tunnel
        .targets
        .select()
        .ok_or(Error::NoTarget(tunnel.record.id))?;
    let (target_host, target_port) = target
        .rsplit_once(':')
        .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(0)))
        .ok_or_else(|| Error::DialFailed(format!("bad target {target}")))?;
    let (stream, spec, client) =
        open_stream_for_tunnel(&ctx, &tunnel, ConnType::Udp5, target, source.to_string()).await?;
    debug!(%source, "udp session opened");
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let upstream = async {
        loop {
            let Ok(Some(data)) =
                tokio::time::timeout(UDP_SESSION_TIMEOUT, rx.recv()).await
            else {
                // Idle or listener gone; either way the session is over.
                return Ok::<(), Error>(());
            };
            let datagram = UdpDatagram {
                host: target_host.clone(),
                port: target_port,
                data,
            };
            let sealed = seal_envelope(&spec, &datagram)?;
            client.rate.acquire(sealed.len()).await;
            write_block(&mut stream_wr, &sealed).await?;
            account(&tunnel, &client, sealed.len() as u64, 0)?;
        }
    };
    let downstream = async {
        loop {
            let block = match read_block(&mut stream_rd).await {
                Ok(block) => block,
                Err(_) => return Ok::<(), Error>(()),
            };
            let raw = codec::open(&spec, &block)
                .map_err(|e| Error::Relay(crate::relay::Error::Codec(e)))?;
            let datagram = UdpDatagram::decode(&raw).map_err(Error::Protocol)?;
            socket.send_to(&datagram.data, source).await?;
            account(&tunnel, &client, 0, datagram.data.len() as u64)?;
        }
    };
    // Either side finishing (idle timeout, EOF, error) ends the session.
    tokio::select! {
        result = upstream => result?,
        result = downstream => result?,
    }
    Ok(())
}

fn seal_envelope(spec: &CodecSpec, datagram: &UdpDatagram) -> Result<Vec<u8>, Error> {
    codec::seal(spec, &datagram.encode()).map_err(crate::relay::Error::Codec).map_err(Error::Relay)
}

fn account(
    tunnel: &TunnelHandle,
    client: &super::ClientHandle,
    inbound: u64,
    outbound: u64,
) -> Result<(), Error> {
    tunnel
        .flow
        .add(inbound, outbound)
        .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
    client
        .flow
        .add(inbound, outbound)
        .map_err(|_| Error::Relay(crate::relay::Error::Quota))?;
    Ok(())
}
