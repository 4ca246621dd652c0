//! End-to-end scenarios: a bridge and a client wired up over loopback.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::arg::BridgeArgs;
use crate::client::{client_main, ClientOptions};
use crate::server::bridge_main;
use crate::transport::TransportKind;
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const KEY: &str = "abc123def0";

/// Reserve a distinct loopback port. The tiny bind-and-release race is
/// acceptable in tests.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A TCP server that echoes whole lines.
async fn echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0_u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, task)
}

/// An HTTP server that answers every request with a fixed marker body.
async fn marker_http_server(marker: &'static str) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0_u8; 8192];
                // One request per connection is enough for the tests.
                let Ok(n) = stream.read(&mut buf).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    marker.len(),
                    marker
                );
                stream.write_all(response.as_bytes()).await.ok();
            });
        }
    });
    (addr, task)
}

struct Harness {
    http_port: u16,
    stop_tx: watch::Sender<bool>,
    bridge: JoinHandle<()>,
    client: JoinHandle<()>,
    _config: tempfile::NamedTempFile,
}

impl Harness {
    /// Bridge + client with the given extra tunnel JSON fragments.
    async fn start(tunnels: Vec<serde_json::Value>) -> Self {
        let bridge_port = free_port().await;
        let http_port = free_port().await;
        let config_json = serde_json::json!({
            "bind": "127.0.0.1",
            "bridge_port": bridge_port,
            "http_port": http_port,
            "clients": [{
                "verify_key": KEY,
                "tunnels": tunnels,
            }],
        });
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config
            .write_all(serde_json::to_vec(&config_json).unwrap().as_slice())
            .unwrap();
        let args = BridgeArgs {
            config: config.path().to_path_buf(),
        };
        let bridge = tokio::spawn(async move {
            bridge_main(&args).await.ok();
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let options = ClientOptions {
            server: format!("127.0.0.1:{bridge_port}"),
            verify_key: KEY.to_string(),
            transport: TransportKind::Tcp,
            tls_skip_verify: false,
            config: None,
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let client = tokio::spawn(async move {
            client_main(options, stop_rx).await.ok();
        });
        Self {
            http_port,
            stop_tx,
            bridge,
            client,
            _config: config,
        }
    }

    fn stop(&self) {
        self.stop_tx.send(true).ok();
        self.bridge.abort();
        self.client.abort();
    }
}

/// Run one request against the tunnel, retrying until the client has
/// registered its data channel.
async fn request_with_retry(port: u16, payload: &[u8], deadline: Duration) -> Vec<u8> {
    let start = std::time::Instant::now();
    loop {
        assert!(
            start.elapsed() < deadline,
            "no tunnel answer within {deadline:?}"
        );
        let attempt = async {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
            conn.write_all(payload).await.ok()?;
            let mut reply = vec![0_u8; payload.len()];
            conn.read_exact(&mut reply).await.ok()?;
            Some(reply)
        };
        match tokio::time::timeout(Duration::from_secs(2), attempt).await {
            Ok(Some(reply)) => return reply,
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

async fn http_get(port: u16, host: &str, path: &str) -> String {
    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    conn.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    String::from_utf8_lossy(&reply).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_tunnel_roundtrip() {
    let (target, _target_task) = echo_server().await;
    let port = free_port().await;
    let harness = Harness::start(vec![serde_json::json!({
        "id": 1, "mode": "tcp", "port": port, "targets": [target.to_string()],
    })])
    .await;
    let reply = request_with_retry(port, b"hello\n", Duration::from_secs(15)).await;
    assert_eq!(reply, b"hello\n");
    harness.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_tunnel_with_crypt_and_compress() {
    let (target, _target_task) = echo_server().await;
    let port = free_port().await;
    let harness = Harness::start(vec![serde_json::json!({
        "id": 2, "mode": "tcp", "port": port, "targets": [target.to_string()],
        "crypt": true, "compress": true,
    })])
    .await;
    let payload = b"the quick brown fox jumps over the lazy dog\n";
    let reply = request_with_retry(port, payload, Duration::from_secs(15)).await;
    assert_eq!(reply, payload);
    harness.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn host_routing_selects_by_host_header() {
    let (target_a, _task_a) = marker_http_server("site-a").await;
    let (target_b, _task_b) = marker_http_server("site-b").await;
    let harness = Harness::start(vec![
        serde_json::json!({
            "id": 10, "mode": "hostProxy", "host": "a.example",
            "targets": [target_a.to_string()],
        }),
        serde_json::json!({
            "id": 11, "mode": "hostProxy", "host": "b.example",
            "targets": [target_b.to_string()],
        }),
    ])
    .await;
    // Wait for the client to come online.
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let reply = http_get(harness.http_port, "a.example", "/").await;
        if reply.contains("site-a") {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no routed answer");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    let reply = http_get(harness.http_port, "b.example", "/").await;
    assert!(reply.contains("site-b"), "unexpected reply: {reply}");
    // Unknown hosts get a bridge-generated 404.
    let reply = http_get(harness.http_port, "c.example", "/").await;
    assert!(
        reply.starts_with("HTTP/1.1 404 Not Found"),
        "unexpected reply: {reply}"
    );
    harness.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn whitelist_challenge_flow() {
    let (target, _target_task) = echo_server().await;
    let port = free_port().await;
    let bridge_port = free_port().await;
    let config_json = serde_json::json!({
        "bind": "127.0.0.1",
        "bridge_port": bridge_port,
        "clients": [{
            "verify_key": KEY,
            "whitelist": ["1.1.1.1"],
            "whitelist_password": "sesame",
            "tunnels": [
                {"id": 3, "mode": "tcp", "port": port, "targets": [target.to_string()]}
            ],
        }],
    });
    let mut config = tempfile::NamedTempFile::new().unwrap();
    config
        .write_all(serde_json::to_vec(&config_json).unwrap().as_slice())
        .unwrap();
    let args = BridgeArgs {
        config: config.path().to_path_buf(),
    };
    let bridge = tokio::spawn(async move {
        bridge_main(&args).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    let options = ClientOptions {
        server: format!("127.0.0.1:{bridge_port}"),
        verify_key: KEY.to_string(),
        transport: TransportKind::Tcp,
        tls_skip_verify: false,
        config: None,
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    let client = tokio::spawn(async move {
        client_main(options, stop_rx).await.ok();
    });

    // 127.0.0.1 is not whitelisted: any request draws the challenge page.
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let reply = http_get(port, "x", "/").await;
        if reply.starts_with("HTTP/1.1 401 Unauthorized") {
            assert!(reply.contains("<html>"), "unexpected reply: {reply}");
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no challenge page");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    // The right password whitelists us.
    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(b"POST /authIp?pass=sesame HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "unexpected: {reply}");
    assert!(reply.contains("{\"success\":true}"));
    // And the next connection forwards normally.
    let reply = request_with_retry(port, b"after auth\n", Duration::from_secs(10)).await;
    assert_eq!(reply, b"after auth\n");
    stop_tx.send(true).ok();
    bridge.abort();
    client.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_reconnects_after_bridge_restart() {
    let (target, _target_task) = echo_server().await;
    let port = free_port().await;
    let bridge_port = free_port().await;
    let config_json = serde_json::json!({
        "bind": "127.0.0.1",
        "bridge_port": bridge_port,
        "clients": [{
            "verify_key": KEY,
            "tunnels": [
                {"id": 4, "mode": "tcp", "port": port, "targets": [target.to_string()]}
            ],
        }],
    });
    let mut config = tempfile::NamedTempFile::new().unwrap();
    config
        .write_all(serde_json::to_vec(&config_json).unwrap().as_slice())
        .unwrap();
    let path = config.path().to_path_buf();
    // The bridge lives in its own runtime so "killing the process" takes
    // every one of its tasks and sockets with it.
    let bridge_rt = tokio::runtime::Runtime::new().unwrap();
    let args = BridgeArgs {
        config: path.clone(),
    };
    bridge_rt.spawn(async move {
        bridge_main(&args).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    let options = ClientOptions {
        server: format!("127.0.0.1:{bridge_port}"),
        verify_key: KEY.to_string(),
        transport: TransportKind::Tcp,
        tls_skip_verify: false,
        config: None,
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    let client = tokio::spawn(async move {
        client_main(options, stop_rx).await.ok();
    });
    let reply = request_with_retry(port, b"before\n", Duration::from_secs(15)).await;
    assert_eq!(reply, b"before\n");

    // Kill the bridge; the supervisor retries every five seconds.
    bridge_rt.shutdown_background();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let bridge_rt = tokio::runtime::Runtime::new().unwrap();
    let args = BridgeArgs { config: path };
    bridge_rt.spawn(async move {
        bridge_main(&args).await.ok();
    });
    // The next tunnel connection succeeds within ten seconds of the
    // bridge returning.
    let reply = request_with_retry(port, b"after\n", Duration::from_secs(20)).await;
    assert_eq!(reply, b"after\n");
    stop_tx.send(true).ok();
    bridge_rt.shutdown_background();
    client.abort();
}
