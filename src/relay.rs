//! The traffic engine: two copy loops per logical stream, with optional
//! codec, rate limiting, traffic accounting and a pre-forward filter.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::codec::{ChunkReader, ChunkWriter, CodecSpec};
use crate::rate::{Flow, RateLimiter};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Relay errors. Everything else at this layer collapses to an EOF-like
/// disposal of the stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] crate::codec::Error),
    #[error("tunnel quota exceeded")]
    Quota,
}

/// Decision of a pre-forward filter on the first bytes of a stream.
#[derive(Debug)]
pub enum FilterAction {
    /// Pass the bytes on and stop filtering.
    Forward,
    /// Send these bytes back to the source and drop the stream.
    Respond(Bytes),
    /// Drop the stream silently.
    Close,
}

const AUTH_OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: application/json\r\n\
Content-Length: 16\r\n\
Connection: close\r\n\
\r\n\
{\"success\":true}";

const AUTH_DENIED_PAGE: &str = "<html><head><title>401 Unauthorized</title></head>\
<body><h1>Unauthorized</h1>\
<p>This address is not on the tunnel's whitelist. Authorize it with:</p>\
<form method=\"post\" action=\"/authIp\"><input name=\"pass\" type=\"password\"/>\
<input type=\"submit\" value=\"Authorize\"/></form></body></html>";

/// In-band IP whitelist challenge. A source that is not on the list gets
/// one chance per connection: `POST /authIp?pass=<password>` joins the
/// list, anything else draws the 401 page.
#[derive(Debug, Clone)]
pub struct WhitelistFilter {
    pub peer: IpAddr,
    pub whitelist: Arc<RwLock<HashSet<IpAddr>>>,
    pub password: String,
}

impl WhitelistFilter {
    pub fn apply(&self, first: &[u8]) -> FilterAction {
        if self.whitelist.read().contains(&self.peer) {
            return FilterAction::Forward;
        }
        if !self.password.is_empty() && self.is_auth_request(first) {
            self.whitelist.write().insert(self.peer);
            debug!(peer = %self.peer, "whitelisted by challenge");
            return FilterAction::Respond(Bytes::from_static(AUTH_OK_RESPONSE.as_bytes()));
        }
        trace!(peer = %self.peer, "denied by whitelist");
        FilterAction::Respond(Bytes::from(format!(
            "HTTP/1.1 401 Unauthorized\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            AUTH_DENIED_PAGE.len(),
            AUTH_DENIED_PAGE
        )))
    }

    /// Matches `POST /authIp?pass=<p>` on the request line.
    fn is_auth_request(&self, first: &[u8]) -> bool {
        let Some(line_end) = first.windows(2).position(|w| w == b"\r\n") else {
            return false;
        };
        let Ok(line) = std::str::from_utf8(&first[..line_end]) else {
            return false;
        };
        let mut parts = line.split_whitespace();
        if parts.next() != Some("POST") {
            return false;
        }
        let Some(path) = parts.next() else {
            return false;
        };
        let Some(query) = path.strip_prefix("/authIp?") else {
            return false;
        };
        query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .any(|(k, v)| k == "pass" && v == self.password)
    }
}

/// Shared accounting for one relayed stream.
#[derive(Debug, Default, Clone)]
pub struct RelayOpts {
    pub rate: Option<Arc<RateLimiter>>,
    /// Per-tunnel counters; the quota lives here.
    pub flow: Option<Arc<Flow>>,
    /// Per-client counters, added on top of the tunnel's.
    pub client_flow: Option<Arc<Flow>>,
    /// Applied once to the first chunk flowing source → target.
    pub filter: Option<WhitelistFilter>,
    /// Bytes already read off the source (e.g. pipelined after a CONNECT
    /// acknowledgment), forwarded before the copy loops start.
    pub preface: Option<Bytes>,
}

impl RelayOpts {
    fn account(&self, inbound: u64, outbound: u64) -> Result<(), Error> {
        if let Some(flow) = &self.flow {
            flow.add(inbound, outbound).map_err(|_| Error::Quota)?;
        }
        if let Some(flow) = &self.client_flow {
            flow.add(inbound, outbound).map_err(|_| Error::Quota)?;
        }
        Ok(())
    }
}

/// Pipe `source` and `target` into each other until both directions have
/// seen EOF, a side fails, or the quota trips.
///
/// `source_spec` and `target_spec` say how bytes on each side are coded;
/// a plain spec is a transparent passthrough. One end of an encrypted or
/// compressed tunnel is always coded (the multiplexer side) while the
/// other is raw.
pub async fn relay<A, B>(
    source: A,
    target: B,
    source_spec: CodecSpec,
    target_spec: CodecSpec,
    opts: RelayOpts,
) -> Result<(), Error>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (source_rd, source_wr) = tokio::io::split(source);
    let (target_rd, target_wr) = tokio::io::split(target);
    let mut up_rd = ChunkReader::new(source_rd, source_spec);
    let mut up_wr = ChunkWriter::new(target_wr, target_spec);
    let mut down_rd = ChunkReader::new(target_rd, target_spec);
    let mut down_wr = ChunkWriter::new(source_wr, source_spec);

    if let Some(preface) = &opts.preface {
        up_wr.write_chunk(preface).await?;
        opts.account(preface.len() as u64, 0)?;
    }

    // The filter intercepts the stream before anything is forwarded; its
    // response goes back on the raw source connection.
    if let Some(filter) = &opts.filter {
        let Some(first) = up_rd.read_chunk().await? else {
            return Ok(());
        };
        match filter.apply(&first) {
            FilterAction::Forward => {
                if let Some(rate) = &opts.rate {
                    rate.acquire(first.len()).await;
                }
                up_wr.write_chunk(&first).await?;
                opts.account(first.len() as u64, 0)?;
            }
            FilterAction::Respond(reply) => {
                down_wr.write_chunk(&reply).await?;
                down_wr.shutdown().await.ok();
                return Ok(());
            }
            FilterAction::Close => return Ok(()),
        }
    }

    // Two independent copy tasks joined on a shared close signal: an error
    // in either direction takes both down, a plain EOF only half-closes.
    let (closing_tx, closing_rx) = watch::channel(false);
    let closing_tx = Arc::new(closing_tx);
    let up_opts = opts.clone();
    let up_closing_tx = closing_tx.clone();
    let mut up_closing_rx = closing_rx.clone();
    let up = tokio::spawn(async move {
        let result =
            copy_direction(&mut up_rd, &mut up_wr, &up_opts, true, &mut up_closing_rx).await;
        if result.is_err() {
            up_closing_tx.send_replace(true);
        }
        result
    });
    let down_opts = opts.clone();
    let mut down_closing_rx = closing_rx;
    let down = tokio::spawn(async move {
        let result = copy_direction(
            &mut down_rd,
            &mut down_wr,
            &down_opts,
            false,
            &mut down_closing_rx,
        )
        .await;
        if result.is_err() {
            closing_tx.send_replace(true);
        }
        result
    });
    let (up_result, down_result) = tokio::join!(up, down);
    up_result.expect("relay task panicked (this is a bug)")?;
    down_result.expect("relay task panicked (this is a bug)")?;
    Ok(())
}

async fn copy_direction<R, W>(
    rd: &mut ChunkReader<R>,
    wr: &mut ChunkWriter<W>,
    opts: &RelayOpts,
    inbound: bool,
    closing_rx: &mut watch::Receiver<bool>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = tokio::select! {
            _ = closing_rx.changed() => {
                trace!("copy loop stopped by the other direction");
                wr.shutdown().await.ok();
                return Ok(());
            }
            chunk = rd.read_chunk() => chunk?,
        };
        let Some(data) = chunk else {
            // EOF propagates as a half-close; the other direction keeps
            // draining until its own EOF.
            wr.shutdown().await.ok();
            return Ok(());
        };
        if let Some(rate) = &opts.rate {
            rate.acquire(data.len()).await;
        }
        wr.write_chunk(&data).await?;
        if inbound {
            opts.account(data.len() as u64, 0)?;
        } else {
            opts.account(0, data.len() as u64)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUFFER_SIZE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn filter(peer: &str, list: &[&str], password: &str) -> WhitelistFilter {
        WhitelistFilter {
            peer: peer.parse().unwrap(),
            whitelist: Arc::new(RwLock::new(
                list.iter().map(|ip| ip.parse().unwrap()).collect(),
            )),
            password: password.to_string(),
        }
    }

    #[test]
    fn whitelisted_peer_forwards() {
        let f = filter("1.1.1.1", &["1.1.1.1"], "sesame");
        assert!(matches!(
            f.apply(b"GET / HTTP/1.1\r\n\r\n"),
            FilterAction::Forward
        ));
    }

    #[test]
    fn challenge_round() {
        let f = filter("2.2.2.2", &["1.1.1.1"], "sesame");
        // Plain request from an unknown address draws the 401 page.
        match f.apply(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n") {
            FilterAction::Respond(reply) => {
                let reply = String::from_utf8_lossy(&reply).into_owned();
                assert!(reply.starts_with("HTTP/1.1 401 Unauthorized"));
                assert!(reply.contains("<html>"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        // Wrong password is still denied.
        match f.apply(b"POST /authIp?pass=wrong HTTP/1.1\r\n\r\n") {
            FilterAction::Respond(reply) => {
                assert!(reply.starts_with(b"HTTP/1.1 401"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        // The challenge answer whitelists the peer and is not forwarded.
        match f.apply(b"POST /authIp?pass=sesame HTTP/1.1\r\n\r\n") {
            FilterAction::Respond(reply) => {
                let reply = String::from_utf8_lossy(&reply).into_owned();
                assert!(reply.starts_with("HTTP/1.1 200 OK"));
                assert!(reply.contains("{\"success\":true}"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(f.whitelist.read().contains(&"2.2.2.2".parse().unwrap()));
        assert!(f.whitelist.read().contains(&"1.1.1.1".parse().unwrap()));
        // The next connection forwards normally.
        assert!(matches!(
            f.apply(b"GET / HTTP/1.1\r\n\r\n"),
            FilterAction::Forward
        ));
    }

    #[tokio::test]
    async fn relay_pipes_both_directions() {
        let (user_near, user_far) = tokio::io::duplex(1 << 16);
        let (tunnel_near, tunnel_far) = tokio::io::duplex(1 << 16);
        let spec = CodecSpec::new(true, true, "abc123def0");
        let relay_task = tokio::spawn(relay(
            user_far,
            tunnel_near,
            CodecSpec::default(),
            spec,
            RelayOpts::default(),
        ));
        // The far tunnel end speaks the coded protocol.
        let (tunnel_rd, tunnel_wr) = tokio::io::split(tunnel_far);
        let mut coded_rd = ChunkReader::new(tunnel_rd, spec);
        let mut coded_wr = ChunkWriter::new(tunnel_wr, spec);
        let (mut user_rd, mut user_wr) = tokio::io::split(user_near);
        user_wr.write_all(b"hello\n").await.unwrap();
        let first = coded_rd.read_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello\n");
        coded_wr.write_chunk(b"world\n").await.unwrap();
        let mut buf = [0_u8; 6];
        user_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world\n");
        user_wr.shutdown().await.unwrap();
        coded_wr.shutdown().await.unwrap();
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quota_closes_within_one_buffer() {
        let quota: u64 = 1 << 20;
        let (user_near, user_far) = tokio::io::duplex(1 << 16);
        let (tunnel_near, tunnel_far) = tokio::io::duplex(1 << 16);
        let flow = Arc::new(Flow::new(quota));
        let opts = RelayOpts {
            flow: Some(flow.clone()),
            ..RelayOpts::default()
        };
        let relay_task = tokio::spawn(relay(
            user_far,
            tunnel_near,
            CodecSpec::default(),
            CodecSpec::default(),
            opts,
        ));
        // Count what actually reaches the target.
        let counter = tokio::spawn(async move {
            let (mut rd, _wr) = tokio::io::split(tunnel_far);
            let mut total = 0_usize;
            let mut buf = vec![0_u8; 8192];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
            total
        });
        let (_user_rd, mut user_wr) = tokio::io::split(user_near);
        let chunk = vec![0x42_u8; 8192];
        let mut sent = 0_usize;
        while sent < (2 << 20) {
            if user_wr.write_all(&chunk).await.is_err() {
                break;
            }
            sent += chunk.len();
        }
        drop(user_wr);
        assert!(matches!(relay_task.await.unwrap(), Err(Error::Quota)));
        let delivered = counter.await.unwrap();
        assert!(delivered as u64 >= quota, "delivered {delivered}");
        assert!(
            (delivered as u64) < quota + BUFFER_SIZE as u64,
            "delivered {delivered}"
        );
    }
}
