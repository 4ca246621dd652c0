//! Constants and the configuration snapshot consumed by the core.
//!
//! The snapshot is read-only here; the administrative side owns the file.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::transport::TransportKind;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Copy-loop buffer size. Quota overshoot is bounded by one buffer.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Default timeout for dialing internal targets and the bridge.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between client reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Idle timeout for per-source UDP tunnel sessions.
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a length-prefixed control message.
pub const CONTROL_MESSAGE_LIMIT: u32 = 1024 * 1024;

/// Upper bound on one coded chunk on the wire.
pub const MAX_CHUNK: u32 = 32 * 1024 * 1024;

/// Width of a rendezvous epoch bucket, in seconds. Keys rotate on the
/// boundary; the two sides may briefly disagree there.
pub const P2P_BUCKET_SECS: u64 = 100;

/// How long a `RGST` source-IP binding lives per requested hour.
pub const REGISTER_TTL_UNIT: Duration = Duration::from_secs(3600);

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_disconnect_secs() -> u64 {
    30
}

/// Tunnel modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TunnelMode {
    Tcp,
    Udp,
    Http,
    HttpProxy,
    Socks5,
    HostProxy,
    P2p,
    Secret,
}

/// PROXY-protocol versions a tunnel may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    None,
    V1,
    V2,
}

/// One tunnel definition from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: u32,
    pub mode: TunnelMode,
    /// Listener port; unused for `hostProxy`, `p2p` and `secret`.
    #[serde(default)]
    pub port: u16,
    /// Routed hostname for `hostProxy`.
    #[serde(default)]
    pub host: String,
    /// Target `host:port` candidates; more than one round-robins.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub crypt: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    /// Byte quota for this tunnel; 0 is unlimited.
    #[serde(default)]
    pub quota: u64,
    /// Dial timeout toward the target, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub secret_password: String,
    #[serde(default)]
    pub p2p_password: String,
    #[serde(default)]
    pub socks_user: String,
    #[serde(default)]
    pub socks_password: String,
}

/// One client definition from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Opaque identity, at least 6 characters.
    pub verify_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bytes per second; 0 is unlimited.
    #[serde(default)]
    pub rate_limit: u64,
    /// Total byte quota across the client's tunnels; 0 is unlimited.
    #[serde(default)]
    pub flow_quota: u64,
    /// Number of tunnels the client may own; 0 is unlimited.
    #[serde(default)]
    pub max_tunnels: u32,
    /// Whether streams for this client must be encrypted.
    #[serde(default)]
    pub crypt: bool,
    #[serde(default = "default_true")]
    pub compress_allowed: bool,
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,
    /// Password for the in-band whitelist challenge.
    #[serde(default)]
    pub whitelist_password: String,
    #[serde(default)]
    pub tunnels: Vec<TunnelRecord>,
}

/// Bridge-side configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub bridge_port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    /// Shared listener port for host-routed HTTP tunnels.
    #[serde(default)]
    pub http_port: Option<u16>,
    /// UDP port for the P2P rendezvous broker.
    #[serde(default)]
    pub p2p_port: Option<u16>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default = "default_disconnect_secs")]
    pub disconnect_timeout_secs: u64,
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
}

/// Health-check probe flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthMode {
    #[default]
    Tcp,
    Http,
}

/// Client-side health check definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub mode: HealthMode,
    #[serde(default = "HealthConfig::default_interval")]
    pub interval_secs: u64,
    #[serde(default = "HealthConfig::default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "HealthConfig::default_max_failures")]
    pub max_failures: u32,
    /// Probed path for HTTP checks.
    #[serde(default)]
    pub path: String,
}

impl HealthConfig {
    fn default_interval() -> u64 {
        10
    }
    fn default_timeout() -> u64 {
        5
    }
    fn default_max_failures() -> u32 {
        3
    }
}

/// Client-side P2P visitor definition: a local port forwarded over the
/// direct UDP path to the provider's target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pVisitorConfig {
    pub password: String,
    pub local_port: u16,
    #[serde(default)]
    pub target: String,
}

/// Client-side configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bridge `host:port`.
    pub server: String,
    pub verify_key: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Tunnels pushed to the bridge after the handshake (`CONF`).
    #[serde(default)]
    pub tunnels: Vec<TunnelRecord>,
    #[serde(default)]
    pub healths: Vec<HealthConfig>,
    #[serde(default)]
    pub p2p_visitors: Vec<P2pVisitorConfig>,
}

/// Configuration errors. The only errors that may abort the process, and
/// only at startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid provisioning code")]
    BadProvisionCode,
    #[error("verify key shorter than 6 characters")]
    WeakKey,
    #[error("missing required {0}")]
    Missing(&'static str),
}

pub async fn load_bridge_config(path: &Path) -> Result<BridgeConfig, Error> {
    let raw = tokio::fs::read(path).await?;
    let config: BridgeConfig = serde_json::from_slice(&raw)?;
    for client in &config.clients {
        if client.verify_key.len() < 6 {
            return Err(Error::WeakKey);
        }
    }
    Ok(config)
}

pub async fn load_client_config(path: &Path) -> Result<ClientConfig, Error> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// A decoded provisioning short-link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provision {
    pub name: Option<String>,
    pub server: String,
    pub verify_key: String,
    pub tls: bool,
}

/// Decode the `nps:NAME|ADDR|KEY|TLS` base64 provisioning format. The
/// older `nps ADDR KEY TLS` form is accepted too.
pub fn decode_provision_code(code: &str) -> Result<Provision, Error> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(code.trim())
        .map_err(|_| Error::BadProvisionCode)?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::BadProvisionCode)?;
    if let Some(rest) = decoded.strip_prefix("nps ") {
        let mut parts = rest.split_whitespace();
        let server = parts.next().ok_or(Error::BadProvisionCode)?;
        let key = parts.next().ok_or(Error::BadProvisionCode)?;
        let tls = parts.next().unwrap_or("false") == "true";
        return Ok(Provision {
            name: None,
            server: server.to_string(),
            verify_key: key.to_string(),
            tls,
        });
    }
    let rest = decoded.strip_prefix("nps:").ok_or(Error::BadProvisionCode)?;
    let parts: Vec<&str> = rest.split('|').collect();
    if parts.len() < 4 {
        return Err(Error::BadProvisionCode);
    }
    Ok(Provision {
        name: Some(parts[0].trim().to_string()).filter(|s| !s.is_empty()),
        server: parts[1].trim().to_string(),
        verify_key: parts[2].trim().to_string(),
        tls: parts[3].trim() == "true",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_code_pipe_format() {
        let code = base64::engine::general_purpose::STANDARD
            .encode("nps:office|bridge.example:8024|abc123def0|true");
        let p = decode_provision_code(&code).unwrap();
        assert_eq!(p.name.as_deref(), Some("office"));
        assert_eq!(p.server, "bridge.example:8024");
        assert_eq!(p.verify_key, "abc123def0");
        assert!(p.tls);
    }

    #[test]
    fn provision_code_legacy_format() {
        let code =
            base64::engine::general_purpose::STANDARD.encode("nps bridge.example:8024 k1k2k3 false");
        let p = decode_provision_code(&code).unwrap();
        assert_eq!(p.name, None);
        assert_eq!(p.server, "bridge.example:8024");
        assert!(!p.tls);
    }

    #[test]
    fn provision_code_rejects_garbage() {
        assert!(decode_provision_code("not base64 at all!").is_err());
        let code = base64::engine::general_purpose::STANDARD.encode("nps:justname|addr");
        assert!(decode_provision_code(&code).is_err());
    }

    #[test]
    fn snapshot_parses_with_defaults() {
        let raw = r#"{
            "bridge_port": 8024,
            "clients": [{
                "verify_key": "abc123def0",
                "tunnels": [
                    {"id": 1, "mode": "tcp", "port": 7001, "targets": ["127.0.0.1:9001"]},
                    {"id": 2, "mode": "hostProxy", "host": "a.example", "targets": ["10.0.0.1:80", "10.0.0.2:80"]}
                ]
            }]
        }"#;
        let config: BridgeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.transport, TransportKind::Tcp);
        let client = &config.clients[0];
        assert!(client.enabled);
        assert_eq!(client.tunnels[1].mode, TunnelMode::HostProxy);
        assert_eq!(client.tunnels[1].targets.len(), 2);
        assert_eq!(client.tunnels[0].proxy_protocol, ProxyProtocol::None);
    }
}
