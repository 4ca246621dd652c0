//! PROXY protocol v1/v2 header emission.
//!
//! Written once to a target connection before any payload, conveying the
//! user's original address. The transport family follows the source
//! address; a target of the other family is reported as unspecified.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::ProxyProtocol;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Build the header bytes, or `None` when the tunnel does not request one.
#[must_use]
pub fn encode(version: ProxyProtocol, source: SocketAddr, dest: SocketAddr) -> Option<Bytes> {
    match version {
        ProxyProtocol::None => None,
        ProxyProtocol::V1 => Some(encode_v1(source, dest)),
        ProxyProtocol::V2 => Some(encode_v2(source, dest)),
    }
}

fn align_dest(source: SocketAddr, dest: SocketAddr) -> SocketAddr {
    match (source, dest) {
        (SocketAddr::V4(_), SocketAddr::V6(d)) => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), d.port())
        }
        (SocketAddr::V6(_), SocketAddr::V4(d)) => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), d.port())
        }
        _ => dest,
    }
}

fn encode_v1(source: SocketAddr, dest: SocketAddr) -> Bytes {
    let dest = align_dest(source, dest);
    let family = if source.is_ipv4() { "TCP4" } else { "TCP6" };
    Bytes::from(format!(
        "PROXY {family} {} {} {} {}\r\n",
        source.ip(),
        dest.ip(),
        source.port(),
        dest.port()
    ))
}

fn encode_v2(source: SocketAddr, dest: SocketAddr) -> Bytes {
    let dest = align_dest(source, dest);
    let mut buf = BytesMut::with_capacity(16 + 36);
    buf.put_slice(&V2_SIGNATURE);
    // Version 2, command PROXY.
    buf.put_u8(0x21);
    match (source.ip(), dest.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            // AF_INET, STREAM.
            buf.put_u8(0x11);
            buf.put_u16(12);
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // AF_INET6, STREAM.
            buf.put_u8(0x21);
            buf.put_u16(36);
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        _ => unreachable!("families aligned above (this is a bug)"),
    }
    buf.put_u16(source.port());
    buf.put_u16(dest.port());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_line_format() {
        let header = encode(
            ProxyProtocol::V1,
            "2.2.2.2:5555".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(&header[..], b"PROXY TCP4 2.2.2.2 10.0.0.1 5555 80\r\n");
    }

    #[test]
    fn v1_mixed_families_blank_the_target() {
        let header = encode(
            ProxyProtocol::V1,
            "[::1]:5555".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(&header[..], b"PROXY TCP6 ::1 :: 5555 80\r\n");
    }

    #[test]
    fn v2_header_layout() {
        let header = encode(
            ProxyProtocol::V2,
            "2.2.2.2:5555".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(&header[..12], &V2_SIGNATURE);
        assert_eq!(header[12], 0x21);
        assert_eq!(header[13], 0x11);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 12);
        assert_eq!(header.len(), 16 + 12);
        assert_eq!(&header[16..20], &[2, 2, 2, 2]);
        assert_eq!(&header[20..24], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([header[24], header[25]]), 5555);
        assert_eq!(u16::from_be_bytes([header[26], header[27]]), 80);
    }

    #[test]
    fn none_yields_no_header() {
        assert!(encode(
            ProxyProtocol::None,
            "1.1.1.1:1".parse().unwrap(),
            "2.2.2.2:2".parse().unwrap()
        )
        .is_none());
    }
}
