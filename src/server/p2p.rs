//! P2P rendezvous broker: matches visitor and provider UDP endpoints by
//! their bucketed password hash and exchanges the observed addresses.
//!
//! The hash is a pure match token; entries expire after one bucket width
//! (100 s), so at a bucket boundary the two sides can briefly compute
//! different keys and miss each other. That window is inherited behavior.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::Error;
use crate::config::P2P_BUCKET_SECS;
use crate::protocol::Tag;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

#[derive(Debug, Default)]
struct PendingPair {
    visitor: Option<SocketAddr>,
    provider: Option<SocketAddr>,
    since: Option<Instant>,
}

pub(super) async fn broker(addr: SocketAddr) -> Result<(), Error> {
    let socket = UdpSocket::bind(addr).await?;
    info!(addr = %socket.local_addr()?, "p2p rendezvous broker listening");
    let mut pending: HashMap<String, PendingPair> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(30));
    let mut buf = [0_u8; 512];
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let deadline = Duration::from_secs(P2P_BUCKET_SECS);
                pending.retain(|_, pair| {
                    pair.since.is_some_and(|since| since.elapsed() < deadline)
                });
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                if len < 4 + 32 {
                    trace!(%peer, "short rendezvous datagram, dropping");
                    continue;
                }
                let Ok(tag) = Tag::parse([buf[0], buf[1], buf[2], buf[3]]) else {
                    continue;
                };
                let key = String::from_utf8_lossy(&buf[4..len]).into_owned();
                let pair = pending.entry(key.clone()).or_default();
                if pair.since.is_none() {
                    pair.since = Some(Instant::now());
                }
                match tag {
                    Tag::P2pVisitor => pair.visitor = Some(peer),
                    Tag::P2pProvider => pair.provider = Some(peer),
                    _ => {
                        trace!(%peer, "unexpected rendezvous tag, dropping");
                        continue;
                    }
                }
                debug!(%peer, ?tag, "rendezvous endpoint observed");
                if let (Some(visitor), Some(provider)) = (pair.visitor, pair.provider) {
                    // Each side learns the other's NAT-observed address;
                    // our role ends here.
                    socket
                        .send_to(provider.to_string().as_bytes(), visitor)
                        .await?;
                    socket
                        .send_to(visitor.to_string().as_bytes(), provider)
                        .await?;
                    info!(%visitor, %provider, "rendezvous pair exchanged");
                    pending.remove(&key);
                }
            }
        }
    }
}
