//! TCP tunnel listener: one public port piped to one client target.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{open_stream_for_tunnel, BridgeCtx, Error, TunnelHandle};
use crate::codec::CodecSpec;
use crate::protocol::ConnType;
use crate::relay::{relay, RelayOpts, WhitelistFilter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// `conn_type` distinguishes plain port forwarding from HTTP-aware
/// forwarding, where the client parses and logs each request.
pub(super) async fn serve(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    conn_type: ConnType,
) -> Result<(), Error> {
    let listener = TcpListener::bind(ctx.bind_addr(tunnel.record.port)).await?;
    info!(
        tunnel = tunnel.record.id,
        addr = %listener.local_addr()?,
        "tcp tunnel listening"
    );
    ctx.sink.tunnel_bound(tunnel.record.id, tunnel.record.port);
    let mut shutdown = tunnel.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(tunnel = tunnel.record.id, "tcp tunnel unbound");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true).ok();
                let ctx = ctx.clone();
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_accept(ctx, tunnel, conn_type, stream, peer).await {
                        debug!("tcp tunnel connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_accept(
    ctx: Arc<BridgeCtx>,
    tunnel: Arc<TunnelHandle>,
    conn_type: ConnType,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    // The listener stays up after the quota trips; fresh connections are
    // turned away until the operator resets the counters.
    if tunnel.flow.exhausted() {
        return Err(Error::Relay(crate::relay::Error::Quota));
    }
    let target = tunnel
        .targets
        .select()
        .ok_or(Error::NoTarget(tunnel.record.id))?;
    let (mux_stream, spec, client) =
        open_stream_for_tunnel(&ctx, &tunnel, conn_type, target, peer.to_string()).await?;
    let opts = RelayOpts {
        rate: Some(client.rate.clone()),
        flow: Some(tunnel.flow.clone()),
        client_flow: Some(client.flow.clone()),
        filter: whitelist_filter(&tunnel, peer),
        preface: None,
    };
    relay(stream, mux_stream, CodecSpec::default(), spec, opts).await?;
    Ok(())
}

/// Build the pre-forward filter when the tunnel's whitelist is enforced.
pub(super) fn whitelist_filter(
    tunnel: &TunnelHandle,
    peer: SocketAddr,
) -> Option<WhitelistFilter> {
    tunnel.whitelist_enabled.then(|| WhitelistFilter {
        peer: peer.ip(),
        whitelist: tunnel.whitelist.clone(),
        password: tunnel.whitelist_password.clone(),
    })
}
