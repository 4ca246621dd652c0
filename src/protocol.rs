//! Control-plane wire protocol: the bridge handshake, role and signal
//! tags, link info, and the SOCKS-style UDP datagram envelope.
//!
//! Every control message is a 4-byte ASCII tag, optionally followed by a
//! `u32_be` length-prefixed body. Bodies are JSON.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{ProxyProtocol, TunnelRecord, CONTROL_MESSAGE_LIMIT};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Our protocol version, sent first on every bridge connection.
pub const PROTOCOL_VERSION: [u8; 3] = [0x01, 0x01, 0x00];

/// The oldest client version the bridge accepts.
pub const MIN_VERSION: [u8; 3] = [0x01, 0x01, 0x00];

/// Wire length of the verify-key digest.
pub const KEY_LEN: usize = 32;

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown control tag {:?}", String::from_utf8_lossy(.0))]
    UnknownTag([u8; 4]),
    #[error("unexpected control tag {0:?}")]
    UnexpectedTag(Tag),
    #[error("control message of {0} bytes is over the limit")]
    MessageTooLong(u32),
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("peer runs incompatible protocol version {0:?}")]
    IncompatibleVersion([u8; 3]),
    #[error("malformed UDP datagram envelope")]
    BadDatagram,
}

/// The 4-byte ASCII control tags. `Main` through `Secret` declare a role
/// on a fresh bridge connection; the rest flow on the signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Signal channel.
    Main,
    /// Data-channel multiplexer.
    Chan,
    /// Push tunnel configuration.
    Conf,
    /// Bind the source IP to the key for a TTL.
    Rgst,
    /// P2P rendezvous, visitor side.
    P2pVisitor,
    /// P2P rendezvous, provider side.
    P2pProvider,
    /// Secret-tunnel visitor.
    Secret,
    /// Ask the client to allocate a UDP endpoint for rendezvous.
    NewUdp,
    /// Push one tunnel to a config-pull client.
    NewConf,
    /// Health-check transition.
    Health,
    Ping,
    Pong,
}

impl Tag {
    #[must_use]
    pub const fn wire(self) -> [u8; 4] {
        match self {
            Self::Main => *b"MAIN",
            Self::Chan => *b"CHAN",
            Self::Conf => *b"CONF",
            Self::Rgst => *b"RGST",
            Self::P2pVisitor => *b"P2PV",
            Self::P2pProvider => *b"P2PP",
            Self::Secret => *b"SECR",
            Self::NewUdp => *b"NUDP",
            Self::NewConf => *b"NEWC",
            Self::Health => *b"HLTH",
            Self::Ping => *b"PING",
            Self::Pong => *b"PONG",
        }
    }

    pub fn parse(raw: [u8; 4]) -> Result<Self, Error> {
        match &raw {
            b"MAIN" => Ok(Self::Main),
            b"CHAN" => Ok(Self::Chan),
            b"CONF" => Ok(Self::Conf),
            b"RGST" => Ok(Self::Rgst),
            b"P2PV" => Ok(Self::P2pVisitor),
            b"P2PP" => Ok(Self::P2pProvider),
            b"SECR" => Ok(Self::Secret),
            b"NUDP" => Ok(Self::NewUdp),
            b"NEWC" => Ok(Self::NewConf),
            b"HLTH" => Ok(Self::Health),
            b"PING" => Ok(Self::Ping),
            b"PONG" => Ok(Self::Pong),
            _ => Err(Error::UnknownTag(raw)),
        }
    }
}

/// Lowercase hex MD5 of a verify key: the 32-byte identity on the wire.
#[must_use]
pub fn key_digest(verify_key: &str) -> String {
    let digest = Md5::digest(verify_key.as_bytes());
    let mut out = String::with_capacity(KEY_LEN);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub async fn write_tag<W: AsyncWrite + Unpin>(wr: &mut W, tag: Tag) -> Result<(), Error> {
    wr.write_all(&tag.wire()).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn read_tag<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Tag, Error> {
    let mut raw = [0_u8; 4];
    rd.read_exact(&mut raw).await?;
    Tag::parse(raw)
}

/// Write a `u32_be` length-prefixed block.
pub async fn write_block<W: AsyncWrite + Unpin>(wr: &mut W, body: &[u8]) -> Result<(), Error> {
    wr.write_all(&(body.len() as u32).to_be_bytes()).await?;
    wr.write_all(body).await?;
    wr.flush().await?;
    Ok(())
}

/// Read a `u32_be` length-prefixed block, bounded by the control limit.
pub async fn read_block<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Bytes, Error> {
    let len = rd.read_u32().await?;
    if len > CONTROL_MESSAGE_LIMIT {
        return Err(Error::MessageTooLong(len));
    }
    let mut body = vec![0_u8; len as usize];
    rd.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

pub async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    wr: &mut W,
    value: &T,
) -> Result<(), Error> {
    let body = serde_json::to_vec(value)?;
    write_block(wr, &body).await
}

pub async fn read_json<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(
    rd: &mut R,
) -> Result<T, Error> {
    let body = read_block(rd).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Client side of the handshake: version exchange plus identity.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    verify_key: &str,
) -> Result<(), Error> {
    conn.write_all(&PROTOCOL_VERSION).await?;
    conn.flush().await?;
    let mut min = [0_u8; 3];
    conn.read_exact(&mut min).await?;
    if PROTOCOL_VERSION < min {
        return Err(Error::IncompatibleVersion(min));
    }
    conn.write_all(key_digest(verify_key).as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

/// Bridge side of the handshake. Returns the client's key digest.
pub async fn bridge_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
) -> Result<String, Error> {
    let mut version = [0_u8; 3];
    conn.read_exact(&mut version).await?;
    conn.write_all(&MIN_VERSION).await?;
    conn.flush().await?;
    if version < MIN_VERSION {
        return Err(Error::IncompatibleVersion(version));
    }
    let mut key = [0_u8; KEY_LEN];
    conn.read_exact(&mut key).await?;
    Ok(String::from_utf8_lossy(&key).into_owned())
}

/// What kind of traffic a logical stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    Tcp,
    /// Length-prefixed SOCKS UDP datagrams.
    Udp5,
    /// The client parses and logs each request on the keep-alive stream.
    Http,
}

/// Per-stream metadata shipped in the `SYN` frame: everything the client
/// needs to dial and dress the target connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub conn_type: ConnType,
    /// Target `host:port`; names are resolved on the client side.
    pub host: String,
    pub crypt: bool,
    pub compress: bool,
    /// The user's remote address, for logs and the PROXY header.
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    /// Dial timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl LinkInfo {
    pub fn encode(&self) -> Bytes {
        // Serialization of a plain struct cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("link info serializes (this is a bug)"))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Body of a `NUDP` request: where the rendezvous broker listens and the
/// tunnel password whose bucketed hash keys the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUdpRequest {
    pub rendezvous: String,
    pub password: String,
}

/// Reply to a visitor's `P2PV` request: where the broker listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousReply {
    pub rendezvous: String,
}

/// Body of a `HLTH` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub target: String,
    pub up: bool,
}

/// Messages flowing on the signal channel after the role declaration.
#[derive(Debug, Clone)]
pub enum SignalMsg {
    NewUdp(NewUdpRequest),
    NewConf(TunnelRecord),
    Health(HealthEvent),
    Ping,
    Pong,
}

pub async fn write_signal<W: AsyncWrite + Unpin>(
    wr: &mut W,
    msg: &SignalMsg,
) -> Result<(), Error> {
    match msg {
        SignalMsg::NewUdp(req) => {
            wr.write_all(&Tag::NewUdp.wire()).await?;
            write_json(wr, req).await
        }
        SignalMsg::NewConf(tunnel) => {
            wr.write_all(&Tag::NewConf.wire()).await?;
            write_json(wr, tunnel).await
        }
        SignalMsg::Health(event) => {
            wr.write_all(&Tag::Health.wire()).await?;
            write_json(wr, event).await
        }
        SignalMsg::Ping => write_tag(wr, Tag::Ping).await,
        SignalMsg::Pong => write_tag(wr, Tag::Pong).await,
    }
}

/// Read the next signal-channel message. Role tags here are a protocol
/// violation and tear the connection down.
pub async fn read_signal<R: AsyncRead + Unpin>(rd: &mut R) -> Result<SignalMsg, Error> {
    let tag = read_tag(rd).await?;
    match tag {
        Tag::NewUdp => Ok(SignalMsg::NewUdp(read_json(rd).await?)),
        Tag::NewConf => Ok(SignalMsg::NewConf(read_json(rd).await?)),
        Tag::Health => Ok(SignalMsg::Health(read_json(rd).await?)),
        Tag::Ping => Ok(SignalMsg::Ping),
        Tag::Pong => Ok(SignalMsg::Pong),
        other => Err(Error::UnexpectedTag(other)),
    }
}

/// A SOCKS-style UDP datagram: `RSV(2) FRAG(1) ATYP addr port data`.
/// Shipped length-prefixed on `udp5` streams so the client can route each
/// datagram independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub host: String,
    pub port: u16,
    pub data: Bytes,
}

impl UdpDatagram {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.host.len() + self.data.len() + 10);
        buf.put_slice(&[0, 0, 0]);
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                buf.put_u8(0x01);
                buf.put_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                buf.put_u8(0x04);
                buf.put_slice(&ip.octets());
            }
            Err(_) => {
                buf.put_u8(0x03);
                buf.put_u8(self.host.len() as u8);
                buf.put_slice(self.host.as_bytes());
            }
        }
        buf.put_u16(self.port);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(raw);
        if buf.len() < 4 {
            return Err(Error::BadDatagram);
        }
        buf.advance(2);
        let frag = buf.get_u8();
        if frag != 0 {
            // Fragmented datagrams are not implemented.
            return Err(Error::BadDatagram);
        }
        let atyp = buf.get_u8();
        let host = match atyp {
            0x01 => {
                if buf.len() < 4 {
                    return Err(Error::BadDatagram);
                }
                let mut octets = [0_u8; 4];
                buf.copy_to_slice(&mut octets);
                Ipv4Addr::from(octets).to_string()
            }
            0x03 => {
                if buf.is_empty() {
                    return Err(Error::BadDatagram);
                }
                let len = usize::from(buf.get_u8());
                if buf.len() < len {
                    return Err(Error::BadDatagram);
                }
                let name = buf.split_to(len);
                String::from_utf8_lossy(&name).into_owned()
            }
            0x04 => {
                if buf.len() < 16 {
                    return Err(Error::BadDatagram);
                }
                let mut octets = [0_u8; 16];
                buf.copy_to_slice(&mut octets);
                Ipv6Addr::from(octets).to_string()
            }
            _ => return Err(Error::BadDatagram),
        };
        if buf.len() < 2 {
            return Err(Error::BadDatagram);
        }
        let port = buf.get_u16();
        Ok(Self {
            host,
            port,
            data: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for tag in [
            Tag::Main,
            Tag::Chan,
            Tag::Conf,
            Tag::Rgst,
            Tag::P2pVisitor,
            Tag::P2pProvider,
            Tag::Secret,
            Tag::NewUdp,
            Tag::NewConf,
            Tag::Health,
            Tag::Ping,
            Tag::Pong,
        ] {
            assert_eq!(Tag::parse(tag.wire()).unwrap(), tag);
        }
        assert!(matches!(Tag::parse(*b"NOPE"), Err(Error::UnknownTag(_))));
    }

    #[test]
    fn key_digest_is_stable_hex() {
        let digest = key_digest("abc123def0");
        assert_eq!(digest.len(), KEY_LEN);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(digest, key_digest("abc123def0"));
        assert_ne!(digest, key_digest("abc123def1"));
    }

    #[tokio::test]
    async fn handshake_exchanges_identity() {
        let (mut client, mut bridge) = tokio::io::duplex(256);
        let client_task =
            tokio::spawn(async move { client_handshake(&mut client, "abc123def0").await });
        let digest = bridge_handshake(&mut bridge).await.unwrap();
        client_task.await.unwrap().unwrap();
        assert_eq!(digest, key_digest("abc123def0"));
    }

    #[tokio::test]
    async fn signal_messages_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msgs = vec![
            SignalMsg::Ping,
            SignalMsg::Health(HealthEvent {
                target: "10.0.0.1:80".into(),
                up: false,
            }),
            SignalMsg::NewUdp(NewUdpRequest {
                rendezvous: "1.2.3.4:8025".into(),
                password: "p".into(),
            }),
            SignalMsg::Pong,
        ];
        for msg in &msgs {
            write_signal(&mut a, msg).await.unwrap();
        }
        assert!(matches!(read_signal(&mut b).await.unwrap(), SignalMsg::Ping));
        match read_signal(&mut b).await.unwrap() {
            SignalMsg::Health(event) => {
                assert_eq!(event.target, "10.0.0.1:80");
                assert!(!event.up);
            }
            other => panic!("unexpected message {other:?}"),
        }
        match read_signal(&mut b).await.unwrap() {
            SignalMsg::NewUdp(req) => assert_eq!(req.rendezvous, "1.2.3.4:8025"),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(read_signal(&mut b).await.unwrap(), SignalMsg::Pong));
    }

    #[test]
    fn link_info_roundtrip() {
        let link = LinkInfo {
            conn_type: ConnType::Tcp,
            host: "127.0.0.1:9001".into(),
            crypt: true,
            compress: false,
            remote_addr: "2.2.2.2:5555".into(),
            proxy_protocol: ProxyProtocol::V2,
            timeout_secs: Some(10),
        };
        let decoded = LinkInfo::decode(&link.encode()).unwrap();
        assert_eq!(decoded.host, link.host);
        assert_eq!(decoded.conn_type, ConnType::Tcp);
        assert_eq!(decoded.proxy_protocol, ProxyProtocol::V2);
    }

    #[test]
    fn udp_datagram_roundtrip() {
        for host in ["1.2.3.4", "internal.example", "::1"] {
            let datagram = UdpDatagram {
                host: host.into(),
                port: 53,
                data: Bytes::from_static(b"query"),
            };
            let decoded = UdpDatagram::decode(&datagram.encode()).unwrap();
            assert_eq!(decoded, datagram);
        }
    }

    #[test]
    fn fragmented_datagram_is_rejected() {
        let mut raw = UdpDatagram {
            host: "1.2.3.4".into(),
            port: 1,
            data: Bytes::new(),
        }
        .encode()
        .to_vec();
        raw[2] = 1;
        assert!(UdpDatagram::decode(&raw).is_err());
    }
}
