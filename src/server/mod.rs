//! The bridge: control-plane handshake, client sessions, and public
//! listeners.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod dispatch;
mod http;
mod p2p;
mod registry;
mod socks5;
mod tcp;
mod udp;

pub(crate) use dispatch::{Dispatcher, TunnelHandle};
pub(crate) use registry::{ClientHandle, Registry, SignalHandle};

use crate::arg::BridgeArgs;
use crate::codec::CodecSpec;
use crate::config::{self, BridgeConfig, ClientRecord, TunnelMode, TunnelRecord, DIAL_TIMEOUT};
use crate::protocol::{
    self, bridge_handshake, read_json, read_signal, read_tag, write_json, ConnType, LinkInfo,
    NewUdpRequest, RendezvousReply, SignalMsg, Tag,
};
use crate::sink::{EventSink, LogSink};
use crate::transport::{self, BoxedStream, Pending};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use warren_mux::{MuxConfig, MuxStream, Multiplexor, Role};

/// Bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Mux(#[from] warren_mux::Error),
    #[error(transparent)]
    Relay(#[from] crate::relay::Error),
    #[error("authentication rejected for key {0}")]
    AuthRejected(String),
    #[error("client is offline")]
    ClientOffline,
    #[error("no healthy target for tunnel {0}")]
    NoTarget(u32),
    #[error("client dial failed: {0}")]
    DialFailed(String),
    #[error("tunnel limit reached")]
    TunnelLimit,
}

/// Everything the bridge's tasks share. Constructed once at startup and
/// passed by reference; there is no global state.
pub(crate) struct BridgeCtx {
    pub registry: Registry,
    pub dispatcher: Dispatcher,
    pub config: ArcSwap<BridgeConfig>,
    pub sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BridgeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCtx").finish_non_exhaustive()
    }
}

impl BridgeCtx {
    fn new(config: BridgeConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry: Registry::from_config(&config.clients),
            dispatcher: Dispatcher::default(),
            config: ArcSwap::from_pointee(config),
            sink,
        }
    }

    fn bind_addr(&self, port: u16) -> SocketAddr {
        let ip: IpAddr = self
            .config
            .load()
            .bind
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().expect("literal parses (this is a bug)"));
        SocketAddr::new(ip, port)
    }

    fn mux_config(&self) -> MuxConfig {
        MuxConfig::default().with_disconnect_timeout(std::time::Duration::from_secs(
            self.config.load().disconnect_timeout_secs,
        ))
    }
}

#[tracing::instrument(skip_all, level = "trace")]
pub async fn bridge_main(args: &BridgeArgs) -> Result<(), Error> {
    let config = config::load_bridge_config(&args.config).await?;
    let transport_kind = config.transport;
    let bridge_port = config.bridge_port;
    let http_port = config.http_port;
    let p2p_port = config.p2p_port;
    let tls_files = config.tls_cert.clone().zip(config.tls_key.clone());
    let ctx = Arc::new(BridgeCtx::new(config, Arc::new(LogSink)));

    // Materialize and bind every configured tunnel.
    let snapshot = ctx.config.load_full();
    for owner in &snapshot.clients {
        if !owner.enabled {
            continue;
        }
        for record in &owner.tunnels {
            bind_tunnel(&ctx, record.clone(), owner);
        }
    }
    if let Some(port) = http_port {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_host_proxy(ctx.clone(), ctx.bind_addr(port)).await {
                error!("host proxy listener failed: {e}");
            }
        });
    }
    if let Some(port) = p2p_port {
        let addr = ctx.bind_addr(port);
        tokio::spawn(async move {
            if let Err(e) = p2p::broker(addr).await {
                error!("p2p broker failed: {e}");
            }
        });
    }

    let mut listener = transport::listen(
        transport_kind,
        ctx.bind_addr(bridge_port),
        tls_files.as_ref().map(|(c, k)| (c.as_str(), k.as_str())),
    )
    .await?;
    info!(
        "bridge listening on {} ({:?})",
        listener.local_addr()?,
        transport_kind
    );
    #[cfg(unix)]
    tokio::spawn(reload_on_sighup(ctx.clone(), args.config.clone()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (pending, peer) = accepted?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, pending, peer).await {
                        debug!("bridge connection from {peer} ended: {e}");
                    }
                });
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Re-read the configuration and swap the snapshot on SIGHUP.
#[cfg(unix)]
async fn reload_on_sighup(ctx: Arc<BridgeCtx>, path: std::path::PathBuf) -> Result<(), Error> {
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    loop {
        sighup.recv().await;
        info!("reloading configuration");
        match config::load_bridge_config(&path).await {
            Ok(new_config) => apply_config(&ctx, new_config),
            Err(e) => error!("config reload failed, keeping the old snapshot: {e}"),
        }
    }
}

/// Publish a new immutable snapshot and re-bind what changed. Clients and
/// tunnels that disappeared are evicted; changed tunnels are re-bound.
fn apply_config(ctx: &Arc<BridgeCtx>, new_config: BridgeConfig) {
    let old = ctx.config.swap(Arc::new(new_config.clone()));
    let desired: HashMap<u32, (&TunnelRecord, &ClientRecord)> = new_config
        .clients
        .iter()
        .filter(|c| c.enabled)
        .flat_map(|c| c.tunnels.iter().map(move |t| (t.id, (t, c))))
        .collect();
    for owner in &old.clients {
        for record in &owner.tunnels {
            let unchanged = desired
                .get(&record.id)
                .is_some_and(|(new_record, _)| *new_record == record);
            if !unchanged {
                if let Some(tunnel) = ctx.dispatcher.remove(record.id) {
                    let (inbound, outbound) = tunnel.flow.totals();
                    ctx.sink.flow_persisted(record.id, inbound, outbound);
                    ctx.sink.tunnel_closed(record.id);
                }
            }
        }
    }
    for (id, (record, owner)) in &desired {
        if ctx.dispatcher.get(*id).is_none() {
            bind_tunnel(ctx, (*record).clone(), owner);
        }
    }
    ctx.registry.sync(&new_config.clients);
}

/// Register a tunnel with the dispatcher and start its listener, if its
/// mode has one.
pub(crate) fn bind_tunnel(ctx: &Arc<BridgeCtx>, record: TunnelRecord, owner: &ClientRecord) {
    let mode = record.mode;
    let id = record.id;
    let port = record.port;
    let tunnel = TunnelHandle::new(record, owner);
    ctx.dispatcher.register(tunnel.clone());
    let ctx = ctx.clone();
    match mode {
        TunnelMode::Tcp => {
            tokio::spawn(async move {
                if let Err(e) = tcp::serve(ctx, tunnel, ConnType::Tcp).await {
                    error!(tunnel = id, "tcp listener failed: {e}");
                }
            });
        }
        TunnelMode::Http => {
            tokio::spawn(async move {
                if let Err(e) = tcp::serve(ctx, tunnel, ConnType::Http).await {
                    error!(tunnel = id, "http listener failed: {e}");
                }
            });
        }
        TunnelMode::HttpProxy => {
            tokio::spawn(async move {
                if let Err(e) = http::serve_http_proxy(ctx, tunnel).await {
                    error!(tunnel = id, "http proxy listener failed: {e}");
                }
            });
        }
        TunnelMode::Socks5 => {
            tokio::spawn(async move {
                if let Err(e) = socks5::serve(ctx, tunnel).await {
                    error!(tunnel = id, "socks5 listener failed: {e}");
                }
            });
        }
        TunnelMode::Udp => {
            tokio::spawn(async move {
                if let Err(e) = udp::serve(ctx, tunnel).await {
                    error!(tunnel = id, "udp listener failed: {e}");
                }
            });
        }
        // Reached through the dispatcher, not through a listener.
        TunnelMode::HostProxy | TunnelMode::Secret | TunnelMode::P2p => {
            ctx.sink.tunnel_bound(id, port);
        }
    }
}

/// One inbound bridge connection: transport handshake, version and key
/// exchange, then the declared role.
async fn handle_connection(
    ctx: Arc<BridgeCtx>,
    pending: Pending,
    peer: SocketAddr,
) -> Result<(), Error> {
    let mut conn = pending.establish().await?;
    let digest = bridge_handshake(&mut conn).await?;
    let Some(client) = ctx.registry.get(&digest) else {
        // Unknown or disabled key: close without a role exchange.
        return Err(Error::AuthRejected(digest));
    };
    match read_tag(&mut conn).await? {
        Tag::Main => handle_main(ctx, client, conn, peer).await,
        Tag::Chan => handle_chan(&ctx, &client, conn),
        Tag::Conf => handle_conf(&ctx, &client, conn).await,
        Tag::Rgst => handle_rgst(&client, conn, peer).await,
        Tag::Secret => handle_secret(&ctx, conn, peer).await,
        Tag::P2pVisitor => handle_p2p_request(&ctx, conn).await,
        other => Err(protocol::Error::UnexpectedTag(other).into()),
    }
}

/// The signal channel. Owns the connection until the client goes away or a
/// newer registration supersedes this one.
async fn handle_main(
    ctx: Arc<BridgeCtx>,
    client: Arc<ClientHandle>,
    conn: BoxedStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    info!(client = %client.digest, %peer, "signal channel up");
    let (mut rd, mut wr) = tokio::io::split(conn);
    let (tx, mut rx) = mpsc::channel::<SignalMsg>(64);
    let (handle, mut cancelled) = SignalHandle::new(tx.clone());
    client.install_signal(handle);
    ctx.sink.client_online(&client.digest);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = protocol::write_signal(&mut wr, &msg).await {
                debug!("signal write failed: {e}");
                break;
            }
        }
    });
    // Config-pull: the client learns its tunnels over the wire.
    for record in &client.record.tunnels {
        tx.send(SignalMsg::NewConf(record.clone())).await.ok();
    }
    let result = loop {
        tokio::select! {
            _ = cancelled.changed() => {
                debug!(client = %client.digest, "signal channel superseded");
                break Ok(());
            }
            msg = read_signal(&mut rd) => match msg {
                Err(e) => break Err(Error::from(e)),
                Ok(SignalMsg::Ping) => {
                    client.touch();
                    tx.send(SignalMsg::Pong).await.ok();
                }
                Ok(SignalMsg::Pong) => client.touch(),
                Ok(SignalMsg::Health(event)) => {
                    ctx.dispatcher.mark_target(&client.digest, &event.target, event.up);
                    ctx.sink.health_changed(&event.target, event.up);
                }
                // NUDP/NEWC only ever flow bridge → client.
                Ok(other) => {
                    warn!(client = %client.digest, "unexpected signal message {other:?}");
                    let tag = match other {
                        SignalMsg::NewUdp(_) => Tag::NewUdp,
                        _ => Tag::NewConf,
                    };
                    break Err(protocol::Error::UnexpectedTag(tag).into());
                }
            }
        }
    };
    client.clear_signal(&tx);
    drop(tx);
    writer.abort();
    ctx.sink.client_offline(&client.digest);
    info!(
        client = %client.digest,
        idle = ?client.last_seen().elapsed(),
        "signal channel down"
    );
    result
}

/// The data channel: wrap the connection in a multiplexer and publish it.
/// The multiplexer task owns the connection from here on.
fn handle_chan(
    ctx: &Arc<BridgeCtx>,
    client: &Arc<ClientHandle>,
    conn: BoxedStream,
) -> Result<(), Error> {
    if !client.online() {
        // A data channel without a signal channel has nothing to serve.
        return Err(Error::ClientOffline);
    }
    let mux = Arc::new(Multiplexor::new(conn, Role::Server, ctx.mux_config()));
    client.install_mux(mux);
    debug!(client = %client.digest, "data channel up");
    Ok(())
}

/// `CONF`: a client pushes its own tunnel definitions.
async fn handle_conf(
    ctx: &Arc<BridgeCtx>,
    client: &Arc<ClientHandle>,
    mut conn: BoxedStream,
) -> Result<(), Error> {
    let pushed: Vec<TunnelRecord> = read_json(&mut conn).await?;
    let existing = ctx.dispatcher.count_for_client(&client.digest);
    let allowed = client.record.max_tunnels;
    if allowed > 0 && existing + pushed.len() as u32 > allowed {
        return Err(Error::TunnelLimit);
    }
    let mut ids = Vec::with_capacity(pushed.len());
    for record in pushed {
        ids.push(record.id);
        info!(client = %client.digest, tunnel = record.id, "tunnel pushed by client");
        bind_tunnel(ctx, record, &client.record);
    }
    write_json(&mut conn, &ids).await?;
    Ok(())
}

/// `RGST`: bind the source IP to this key for the requested TTL.
async fn handle_rgst(
    client: &Arc<ClientHandle>,
    mut conn: BoxedStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    #[derive(serde::Deserialize)]
    struct Register {
        hours: u32,
    }
    let req: Register = read_json(&mut conn).await?;
    let ttl = crate::config::REGISTER_TTL_UNIT * req.hours.max(1);
    client.register_ip(peer.ip(), ttl);
    info!(client = %client.digest, ip = %peer.ip(), hours = req.hours, "source IP registered");
    Ok(())
}

/// `SECR`: splice the visitor connection onto the secret tunnel's target.
async fn handle_secret(
    ctx: &Arc<BridgeCtx>,
    mut conn: BoxedStream,
    peer: SocketAddr,
) -> Result<(), Error> {
    let body = protocol::read_block(&mut conn).await?;
    let password_digest = String::from_utf8_lossy(&body).into_owned();
    let Some(tunnel) = ctx.dispatcher.by_secret(&password_digest) else {
        return Err(Error::AuthRejected(password_digest));
    };
    let target = tunnel
        .targets
        .select()
        .ok_or(Error::NoTarget(tunnel.record.id))?;
    let (stream, spec, client) =
        open_stream_for_tunnel(ctx, &tunnel, ConnType::Tcp, target, peer.to_string()).await?;
    let opts = crate::relay::RelayOpts {
        rate: Some(client.rate.clone()),
        flow: Some(tunnel.flow.clone()),
        client_flow: Some(client.flow.clone()),
        filter: None,
        preface: None,
    };
    crate::relay::relay(conn, stream, CodecSpec::default(), spec, opts).await?;
    Ok(())
}

/// `P2PV` over TCP: point the visitor and the provider at the rendezvous
/// broker.
async fn handle_p2p_request(ctx: &Arc<BridgeCtx>, mut conn: BoxedStream) -> Result<(), Error> {
    let body = protocol::read_block(&mut conn).await?;
    let password_digest = String::from_utf8_lossy(&body).into_owned();
    let Some(tunnel) = ctx.dispatcher.by_p2p_password(&password_digest) else {
        return Err(Error::AuthRejected(password_digest));
    };
    let config = ctx.config.load();
    let Some(p2p_port) = config.p2p_port else {
        return Err(Error::NoTarget(tunnel.record.id));
    };
    let rendezvous = format!("{}:{}", config.bind, p2p_port);
    let Some(owner) = ctx.registry.get(&tunnel.client_digest) else {
        return Err(Error::ClientOffline);
    };
    let Some(signal_tx) = owner.signal_tx() else {
        return Err(Error::ClientOffline);
    };
    signal_tx
        .send(SignalMsg::NewUdp(NewUdpRequest {
            rendezvous: rendezvous.clone(),
            password: tunnel.record.p2p_password.clone(),
        }))
        .await
        .map_err(|_| Error::ClientOffline)?;
    write_json(&mut conn, &RendezvousReply { rendezvous }).await?;
    Ok(())
}

/// Open a logical stream to a tunnel's owner and work out the codec both
/// ends will speak.
pub(crate) async fn open_stream_for_tunnel(
    ctx: &BridgeCtx,
    tunnel: &TunnelHandle,
    conn_type: ConnType,
    target: String,
    remote_addr: String,
) -> Result<(MuxStream, CodecSpec, Arc<ClientHandle>), Error> {
    let client = ctx
        .registry
        .get(&tunnel.client_digest)
        .ok_or(Error::ClientOffline)?;
    let mux = client.mux().ok_or(Error::ClientOffline)?;
    let crypt = tunnel.record.crypt || client.record.crypt;
    let compress = tunnel.record.compress && client.record.compress_allowed;
    let link = LinkInfo {
        conn_type,
        host: target,
        crypt,
        compress,
        remote_addr,
        proxy_protocol: tunnel.record.proxy_protocol,
        timeout_secs: tunnel.record.timeout_secs,
    };
    let stream = tokio::time::timeout(DIAL_TIMEOUT, mux.new_stream(link.encode()))
        .await
        .map_err(|_| Error::DialFailed("dial timed out".to_string()))?
        .map_err(|e| match e {
            warren_mux::Error::StreamRefused(reason) => Error::DialFailed(reason),
            other => Error::Mux(other),
        })?;
    client.touch();
    Ok((
        stream,
        CodecSpec::new(crypt, compress, &client.verify_key),
        client,
    ))
}
