//! The client runtime: outbound control channel, data-channel accept
//! loop, and the reconnect supervisor.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod health;
mod p2p;

use crate::codec::CodecSpec;
use crate::config::{ClientConfig, DIAL_TIMEOUT, RECONNECT_DELAY};
use crate::protocol::{
    self, client_handshake, read_signal, write_json, write_tag, ConnType, LinkInfo, SignalMsg, Tag,
};
use crate::proxy_proto;
use crate::relay::{relay, RelayOpts};
use crate::transport::{self, TransportKind};
use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use warren_mux::{Dupe, IncomingStream, MuxConfig, Multiplexor, Role};

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error(transparent)]
    Mux(#[from] warren_mux::Error),
    #[error("bridge dial timed out")]
    DialTimeout,
    #[error("bridge rejected the registration")]
    AuthRejected,
    #[error("data channel lost")]
    ChannelLost,
}

/// Connection parameters, from flags, a provisioning code, or a config
/// file.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: String,
    pub verify_key: String,
    pub transport: TransportKind,
    pub tls_skip_verify: bool,
    pub config: Option<ClientConfig>,
}

/// Supervisors currently running, by identity. Re-entry is a no-op.
static RUNNING: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

struct RunningGuard(String);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.lock().remove(&self.0);
    }
}

/// The outer supervisor: run sessions forever, sleeping five seconds
/// between attempts, until `stop` flips.
#[tracing::instrument(skip_all, fields(server = %opts.server), level = "debug")]
pub async fn client_main(opts: ClientOptions, mut stop: watch::Receiver<bool>) -> Result<(), Error> {
    let identity = format!("{}@{}", protocol::key_digest(&opts.verify_key), opts.server);
    let _guard = {
        let mut running = RUNNING.lock();
        if !running.insert(identity.clone()) {
            info!("client supervisor already running for this identity");
            return Ok(());
        }
        RunningGuard(identity)
    };
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        match run_session(&opts, stop.clone()).await {
            Ok(()) => info!("session ended"),
            Err(e) => {
                error!("connection to the bridge failed, retrying in five seconds: {e}");
            }
        }
        if *stop.borrow() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = stop.changed() => return Ok(()),
        }
    }
}

async fn dial_bridge(opts: &ClientOptions, role: Tag) -> Result<transport::BoxedStream, Error> {
    let mut conn = tokio::time::timeout(
        DIAL_TIMEOUT,
        transport::dial(opts.transport, &opts.server, opts.tls_skip_verify),
    )
    .await
    .map_err(|_| Error::DialTimeout)??;
    client_handshake(&mut conn, &opts.verify_key)
        .await
        .map_err(|e| match e {
            // An abrupt close right after the key exchange is the
            // bridge's way of saying no.
            protocol::Error::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::AuthRejected
            }
            other => Error::Protocol(other),
        })?;
    write_tag(&mut conn, role).await?;
    Ok(conn)
}

/// One connected session: signal channel, data channel, health checks and
/// P2P visitors. Returns when anything load-bearing dies.
async fn run_session(opts: &ClientOptions, mut stop: watch::Receiver<bool>) -> Result<(), Error> {
    let signal = dial_bridge(opts, Tag::Main).await?;
    info!("connected to bridge {}", opts.server);

    // Push our tunnel definitions before anything else (config-push mode).
    if let Some(config) = &opts.config {
        if !config.tunnels.is_empty() {
            let mut conf_conn = dial_bridge(opts, Tag::Conf).await?;
            write_json(&mut conf_conn, &config.tunnels).await?;
            let ids: Vec<u32> = protocol::read_json(&mut conf_conn).await?;
            info!("bridge accepted tunnels {ids:?}");
        }
    }

    let chan = dial_bridge(opts, Tag::Chan).await?;
    let mux = Arc::new(Multiplexor::new(chan, Role::Client, MuxConfig::default()));

    let (mut signal_rd, mut signal_wr) = tokio::io::split(signal);
    let (sig_tx, mut sig_rx) = mpsc::channel::<SignalMsg>(64);
    let signal_writer = tokio::spawn(async move {
        while let Some(msg) = sig_rx.recv().await {
            if protocol::write_signal(&mut signal_wr, &msg).await.is_err() {
                break;
            }
        }
    });

    if let Some(config) = &opts.config {
        for check in &config.healths {
            tokio::spawn(health::supervise(
                check.clone(),
                sig_tx.clone(),
                stop.clone(),
            ));
        }
        for visitor in &config.p2p_visitors {
            tokio::spawn(p2p::visitor(
                opts.clone(),
                visitor.clone(),
                stop.clone(),
            ));
        }
    }

    // Local UDP endpoints stay pinned per rendezvous bucket.
    let p2p_cache: Arc<Mutex<HashMap<String, SocketAddr>>> = Arc::new(Mutex::new(HashMap::new()));

    let verify_key = opts.verify_key.clone();
    let accept_mux = mux.dupe();
    let accept_loop = async {
        loop {
            let incoming = accept_mux.accept_stream().await?;
            let verify_key = verify_key.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(verify_key, incoming).await {
                    debug!("stream ended: {e}");
                }
            });
        }
        // Unreachable; gives the block a return type.
        #[allow(unreachable_code)]
        Ok::<(), Error>(())
    };

    let signal_loop = async {
        loop {
            match read_signal(&mut signal_rd).await? {
                SignalMsg::Ping => {
                    sig_tx.send(SignalMsg::Pong).await.ok();
                }
                SignalMsg::Pong => trace!("bridge pong"),
                SignalMsg::NewUdp(req) => {
                    debug!("rendezvous requested via {}", req.rendezvous);
                    tokio::spawn(p2p::provider(
                        opts.clone(),
                        req,
                        p2p_cache.clone(),
                    ));
                }
                SignalMsg::NewConf(tunnel) => {
                    info!(tunnel = tunnel.id, "tunnel pushed by bridge");
                }
                SignalMsg::Health(event) => {
                    debug!("health echo for {}: up={}", event.target, event.up);
                }
            }
        }
        #[allow(unreachable_code)]
        Ok::<(), Error>(())
    };

    // Keepalive on the signal channel plus the data-channel liveness
    // check the multiplexer maintains internally.
    let ping_mux = mux.dupe();
    let ping_tx = sig_tx.clone();
    let ping_loop = async {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            if ping_mux.is_closed() {
                return Err(Error::ChannelLost);
            }
            if ping_tx.send(SignalMsg::Ping).await.is_err() {
                return Err(Error::ChannelLost);
            }
        }
        #[allow(unreachable_code)]
        Ok::<(), Error>(())
    };

    let result = tokio::select! {
        r = accept_loop => r,
        r = signal_loop => r,
        r = ping_loop => r,
        _ = stop.changed() => Ok(()),
    };
    mux.close();
    signal_writer.abort();
    result
}

/// Serve one incoming logical stream: dial the target, then pipe.
async fn handle_stream(verify_key: String, incoming: IncomingStream) -> Result<(), Error> {
    let link = match LinkInfo::decode(incoming.link()) {
        Ok(link) => link,
        Err(e) => {
            incoming.reject("bad link info");
            return Err(e.into());
        }
    };
    let spec = CodecSpec::new(link.crypt, link.compress, &verify_key);
    if link.conn_type == ConnType::Udp5 {
        let stream = incoming.accept()?;
        return serve_udp_stream(stream, spec).await;
    }
    let dial_timeout = link
        .timeout_secs
        .map_or(DIAL_TIMEOUT, Duration::from_secs);
    let target = match tokio::time::timeout(dial_timeout, dial_target(&link.host)).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            warn!("connect to {} failed: {e}", link.host);
            incoming.reject(&e.to_string());
            return Ok(());
        }
        Err(_) => {
            warn!("connect to {} timed out", link.host);
            incoming.reject("dial timed out");
            return Ok(());
        }
    };
    trace!(
        "new {:?} connection to {}, remote address {}",
        link.conn_type,
        link.host,
        link.remote_addr
    );
    let mut target = target;
    if let Some(header) = proxy_header(&link, &target) {
        target.write_all(&header).await?;
    }
    let stream = incoming.accept()?;
    if link.conn_type == ConnType::Http {
        serve_http_stream(stream, target, spec, link.remote_addr).await
    } else {
        relay(target, stream, CodecSpec::default(), spec, RelayOpts::default())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

async fn dial_target(host: &str) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(host).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// PROXY header bytes for a target connection, source overridden by the
/// link info when present.
fn proxy_header(link: &LinkInfo, target: &TcpStream) -> Option<bytes::Bytes> {
    let dest = target.peer_addr().ok()?;
    let source: SocketAddr = link
        .remote_addr
        .parse()
        .unwrap_or(dest);
    proxy_proto::encode(link.proxy_protocol, source, dest)
}

/// `http` streams forward transparently, but every request head is parsed
/// out of the byte flow for a log line.
async fn serve_http_stream(
    stream: warren_mux::MuxStream,
    target: TcpStream,
    spec: CodecSpec,
    remote_addr: String,
) -> Result<(), Error> {
    use crate::codec::{ChunkReader, ChunkWriter};
    let (stream_rd, stream_wr) = tokio::io::split(stream);
    let mut requests = ChunkReader::new(stream_rd, spec);
    let mut responses = ChunkWriter::new(stream_wr, spec);
    let (mut target_rd, mut target_wr) = target.into_split();
    // EOF half-closes; only an error takes the other direction down.
    let (closing_tx, mut response_closing) = watch::channel(false);
    let mut request_closing = closing_tx.subscribe();
    let response_pump = async {
        let mut buf = vec![0_u8; crate::config::BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = response_closing.changed() => break,
                n = target_rd.read(&mut buf) => n,
            };
            let n = match n {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    closing_tx.send_replace(true);
                    return Err(Error::Io(e));
                }
            };
            if let Err(e) = responses.write_chunk(&buf[..n]).await {
                closing_tx.send_replace(true);
                return Err(Error::Io(std::io::Error::other(e)));
            }
        }
        responses.shutdown().await.ok();
        Ok::<(), Error>(())
    };
    let request_pump = async {
        let mut log_scan = RequestLogScanner::new(remote_addr);
        loop {
            let chunk = tokio::select! {
                _ = request_closing.changed() => break,
                chunk = requests.read_chunk() => chunk,
            };
            let data = match chunk {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    closing_tx.send_replace(true);
                    return Err(Error::Io(std::io::Error::other(e)));
                }
            };
            log_scan.feed(&data);
            if let Err(e) = target_wr.write_all(&data).await {
                closing_tx.send_replace(true);
                return Err(Error::Io(e));
            }
        }
        target_wr.shutdown().await.ok();
        Ok::<(), Error>(())
    };
    let (response_result, request_result) = tokio::join!(response_pump, request_pump);
    response_result?;
    request_result
}

/// Scans the request byte flow for heads, purely for logging. Forwarding
/// never waits on it.
struct RequestLogScanner {
    remote_addr: String,
    buf: BytesMut,
    /// Body bytes still to skip before the next head.
    skip: u64,
    /// Untracked framing seen; stop scanning.
    opaque: bool,
}

impl RequestLogScanner {
    fn new(remote_addr: String) -> Self {
        Self {
            remote_addr,
            buf: BytesMut::new(),
            skip: 0,
            opaque: false,
        }
    }

    fn feed(&mut self, mut data: &[u8]) {
        if self.opaque {
            return;
        }
        while !data.is_empty() {
            if self.skip > 0 {
                let eat = (self.skip as usize).min(data.len());
                self.skip -= eat as u64;
                data = &data[eat..];
                continue;
            }
            self.buf.extend_from_slice(data);
            data = &[];
            let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                if self.buf.len() > 64 * 1024 {
                    self.opaque = true;
                }
                return;
            };
            let head = self.buf.split_to(end + 4);
            match parse_for_log(&head) {
                Some((method, host, url, xff, content_length, chunked)) => {
                    let remote = if xff.is_empty() {
                        self.remote_addr.clone()
                    } else {
                        xff
                    };
                    info!(
                        method = %method,
                        host = %host,
                        url = %url,
                        remote = %remote,
                        "http request"
                    );
                    if chunked {
                        self.opaque = true;
                        return;
                    }
                    // Skip the body; leftover bytes in `buf` count first.
                    let buffered = self.buf.len() as u64;
                    if content_length > buffered {
                        self.skip = content_length - buffered;
                        self.buf.clear();
                    } else {
                        let _ = self.buf.split_to(content_length as usize);
                    }
                }
                None => {
                    self.opaque = true;
                    return;
                }
            }
        }
    }
}

fn parse_for_log(head: &[u8]) -> Option<(String, String, String, String, u64, bool)> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    if !matches!(req.parse(head), Ok(httparse::Status::Complete(_))) {
        return None;
    }
    let method = req.method?.to_string();
    let url = req.path?.to_string();
    let mut host = String::new();
    let mut xff = String::new();
    let mut content_length = 0_u64;
    let mut chunked = false;
    for header in req.headers.iter() {
        match header.name.to_ascii_lowercase().as_str() {
            "host" => host = String::from_utf8_lossy(header.value).into_owned(),
            "x-forwarded-for" => xff = String::from_utf8_lossy(header.value).into_owned(),
            "content-length" => {
                content_length = String::from_utf8_lossy(header.value)
                    .trim()
                    .parse()
                    .unwrap_or(0);
            }
            "transfer-encoding" => {
                chunked |= String::from_utf8_lossy(header.value)
                    .to_ascii_lowercase()
                    .contains("chunked");
            }
            _ => {}
        }
    }
    Some((method, host, url, xff, content_length, chunked))
}

/// `udp5` streams carry length-prefixed SOCKS datagrams; each datagram is
/// resolved and forwarded on a local UDP socket.
async fn serve_udp_stream(stream: warren_mux::MuxStream, spec: CodecSpec) -> Result<(), Error> {
    use crate::codec;
    use crate::protocol::{read_block, write_block, UdpDatagram};
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let local = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let outbound = async {
        loop {
            let block = match read_block(&mut stream_rd).await {
                Ok(block) => block,
                Err(_) => return Ok::<(), Error>(()),
            };
            let raw = codec::open(&spec, &block)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            let datagram = UdpDatagram::decode(&raw)?;
            let Some(addr) = tokio::net::lookup_host((datagram.host.as_str(), datagram.port))
                .await?
                .next()
            else {
                debug!("cannot resolve {}:{}", datagram.host, datagram.port);
                continue;
            };
            local.send_to(&datagram.data, addr).await?;
        }
    };
    let inbound = async {
        let mut buf = vec![0_u8; 65536];
        loop {
            let (n, from) = local.recv_from(&mut buf).await?;
            let datagram = UdpDatagram {
                host: from.ip().to_string(),
                port: from.port(),
                data: bytes::Bytes::copy_from_slice(&buf[..n]),
            };
            let sealed = codec::seal(&spec, &datagram.encode())
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            write_block(&mut stream_wr, &sealed).await?;
        }
    };
    tokio::select! {
        r = outbound => r,
        r = inbound => r,
    }
}
