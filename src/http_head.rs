//! Incremental HTTP/1.x request-head parsing for the proxy front-ends.
//!
//! Only the head is parsed; bodies are forwarded by `Content-Length` (or
//! the connection degrades to a blind pipe for framings we do not track).
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Caps a request head; anything bigger is rejected.
const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed request head")]
    Malformed,
    #[error("request head over {MAX_HEAD} bytes")]
    TooLarge,
}

/// A parsed request head plus the raw bytes it came from.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent (origin, absolute or authority form).
    pub target: String,
    pub version: u8,
    pub host: String,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub keep_alive: bool,
    pub x_forwarded_for: Option<String>,
    headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Serialize the head, appending `addr` to `X-Forwarded-For` and
    /// optionally replacing the request target (for proxy-form rewrites).
    #[must_use]
    pub fn serialize(&self, forwarded_for: Option<&str>, target_override: Option<&str>) -> Bytes {
        let mut out = BytesMut::with_capacity(512);
        let target = target_override.unwrap_or(&self.target);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, target, self.version).as_bytes(),
        );
        let mut wrote_xff = false;
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            // Hop-by-hop headers never cross the proxy.
            if lower == "proxy-connection" || lower == "proxy-authorization" {
                continue;
            }
            if lower == "x-forwarded-for" {
                if let Some(addr) = forwarded_for {
                    out.extend_from_slice(name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(value);
                    out.extend_from_slice(format!(", {addr}\r\n").as_bytes());
                    wrote_xff = true;
                    continue;
                }
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        if let Some(addr) = forwarded_for {
            if !wrote_xff {
                out.extend_from_slice(format!("X-Forwarded-For: {addr}\r\n").as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// The `X-Forwarded-For` value, or a fallback remote address.
    #[must_use]
    pub fn forwarded_source(&self, remote: &str) -> String {
        self.x_forwarded_for
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| remote.to_string())
    }
}

/// Read one request head from `rd`. `buf` buffers the connection: on
/// return it holds any bytes past the head (body or the next request).
/// `Ok(None)` is a clean EOF between requests.
pub async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<RequestHead>, Error> {
    loop {
        if let Some(end) = find_head_end(buf) {
            let head_bytes = buf.split_to(end);
            return Ok(Some(parse_head(&head_bytes)?));
        }
        if buf.len() > MAX_HEAD {
            return Err(Error::TooLarge);
        }
        let mut chunk = [0_u8; 8 * 1024];
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Error::Malformed),
    }
    let method = req.method.ok_or(Error::Malformed)?.to_string();
    let target = req.path.ok_or(Error::Malformed)?.to_string();
    let version = req.version.ok_or(Error::Malformed)?;
    let mut host = String::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut connection = None;
    let mut x_forwarded_for = None;
    let mut parsed_headers = Vec::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let lower = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).into_owned();
        match lower.as_str() {
            "host" => host = value.clone(),
            "content-length" => content_length = value.trim().parse().ok(),
            "transfer-encoding" => chunked |= value.to_ascii_lowercase().contains("chunked"),
            "connection" => connection = Some(value.to_ascii_lowercase()),
            "x-forwarded-for" => x_forwarded_for = Some(value.clone()),
            _ => {}
        }
        parsed_headers.push((header.name.to_string(), header.value.to_vec()));
    }
    let keep_alive = match connection.as_deref() {
        Some(c) if c.contains("close") => false,
        Some(c) if c.contains("keep-alive") => true,
        _ => version >= 1,
    };
    Ok(RequestHead {
        method,
        target,
        version,
        host,
        content_length,
        chunked,
        keep_alive,
        x_forwarded_for,
        headers: parsed_headers,
    })
}

/// `host[:port]` of an absolute-form request target, with the target
/// rewritten to origin form. Falls back to the Host header.
#[must_use]
pub fn split_absolute_target(head: &RequestHead) -> (String, String) {
    let target = &head.target;
    let stripped = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    match stripped {
        Some(rest) => {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            (authority.to_string(), path.to_string())
        }
        None => (head.host.clone(), target.clone()),
    }
}

/// Append a default port to an authority that lacks one.
#[must_use]
pub fn with_default_port(authority: &str, default_port: u16) -> String {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        if rest.contains("]:") {
            authority.to_string()
        } else {
            format!("{authority}:{default_port}")
        }
    } else if authority.matches(':').count() > 1 {
        // Bare IPv6 literal.
        format!("[{authority}]:{default_port}")
    } else if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:{default_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_a_simple_request() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: a.example\r\nUser-Agent: curl\r\n\r\nleftover";
        let mut buf = BytesMut::new();
        let head = read_head(&mut &raw[..], &mut buf).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert_eq!(head.host, "a.example");
        assert!(head.keep_alive);
        assert_eq!(&buf[..], b"leftover");
    }

    #[tokio::test]
    async fn eof_between_requests_is_clean() {
        let raw: &[u8] = b"";
        let mut buf = BytesMut::new();
        assert!(read_head(&mut &raw[..], &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn serialize_appends_forwarded_for() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.example\r\nX-Forwarded-For: 9.9.9.9\r\n\r\n";
        let mut buf = BytesMut::new();
        let head = read_head(&mut &raw[..], &mut buf).await.unwrap().unwrap();
        let out = head.serialize(Some("2.2.2.2"), None);
        let text = String::from_utf8_lossy(&out).into_owned();
        assert!(text.contains("X-Forwarded-For: 9.9.9.9, 2.2.2.2\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn serialize_strips_proxy_headers_and_rewrites_target() {
        let raw =
            b"GET http://b.example/api HTTP/1.1\r\nHost: b.example\r\nProxy-Connection: keep-alive\r\n\r\n";
        let mut buf = BytesMut::new();
        let head = read_head(&mut &raw[..], &mut buf).await.unwrap().unwrap();
        let (authority, path) = split_absolute_target(&head);
        assert_eq!(authority, "b.example");
        assert_eq!(path, "/api");
        let out = head.serialize(Some("2.2.2.2"), Some(&path));
        let text = String::from_utf8_lossy(&out).into_owned();
        assert!(text.starts_with("GET /api HTTP/1.1\r\n"));
        assert!(!text.contains("Proxy-Connection"));
    }

    #[test]
    fn default_ports() {
        assert_eq!(with_default_port("b.example", 80), "b.example:80");
        assert_eq!(with_default_port("b.example:8080", 80), "b.example:8080");
    }
}
