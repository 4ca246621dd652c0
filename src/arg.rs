//! Command-line argument parsing and option resolution.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::client::ClientOptions;
use crate::config::{self, decode_provision_code};
use crate::transport::TransportKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// An intranet-penetration reverse tunneling bridge and client.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Commands,
    /// Print more logs (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Print fewer logs (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the public-facing bridge
    Bridge(BridgeArgs),
    /// Run the intranet client
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct BridgeArgs {
    /// Configuration snapshot (clients, tunnels, listeners)
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Bridge address as host:port
    #[arg(short, long)]
    pub server: Option<String>,
    /// Verify key identifying this client
    #[arg(short, long)]
    pub key: Option<String>,
    /// Transport for the bridge connection
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,
    /// Accept the bridge certificate without verification
    #[arg(long)]
    pub tls_skip_verify: bool,
    /// Base64 provisioning code (nps:NAME|ADDR|KEY|TLS)
    #[arg(long)]
    pub code: Option<String>,
    /// Client configuration file (tunnels, health checks, p2p)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Merge flags, the config file and the provisioning code; explicit flags
/// win, then the file, then the code.
pub async fn resolve_client_options(args: &ClientArgs) -> Result<ClientOptions, config::Error> {
    let file = match &args.config {
        Some(path) => Some(config::load_client_config(path).await?),
        None => None,
    };
    let provision = match &args.code {
        Some(code) => Some(decode_provision_code(code)?),
        None => None,
    };
    let server = args
        .server
        .clone()
        .or_else(|| file.as_ref().map(|f| f.server.clone()))
        .or_else(|| provision.as_ref().map(|p| p.server.clone()))
        .ok_or(config::Error::Missing("server address"))?;
    let verify_key = args
        .key
        .clone()
        .or_else(|| file.as_ref().map(|f| f.verify_key.clone()))
        .or_else(|| provision.as_ref().map(|p| p.verify_key.clone()))
        .ok_or(config::Error::Missing("verify key"))?;
    if verify_key.len() < 6 {
        return Err(config::Error::WeakKey);
    }
    let transport = args
        .transport
        .or_else(|| file.as_ref().map(|f| f.transport))
        .unwrap_or_else(|| {
            if provision.as_ref().is_some_and(|p| p.tls) {
                TransportKind::Tls
            } else {
                TransportKind::Tcp
            }
        });
    let tls_skip_verify =
        args.tls_skip_verify || file.as_ref().is_some_and(|f| f.tls_skip_verify);
    Ok(ClientOptions {
        server,
        verify_key,
        transport,
        tls_skip_verify,
        config: file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[tokio::test]
    async fn provisioning_code_fills_the_gaps() {
        let code = base64::engine::general_purpose::STANDARD
            .encode("nps:site|bridge.example:8024|abc123def0|true");
        let args = ClientArgs {
            server: None,
            key: None,
            transport: None,
            tls_skip_verify: false,
            code: Some(code),
            config: None,
        };
        let opts = resolve_client_options(&args).await.unwrap();
        assert_eq!(opts.server, "bridge.example:8024");
        assert_eq!(opts.verify_key, "abc123def0");
        assert_eq!(opts.transport, TransportKind::Tls);
    }

    #[tokio::test]
    async fn explicit_flags_win() {
        let code = base64::engine::general_purpose::STANDARD
            .encode("nps:site|bridge.example:8024|abc123def0|true");
        let args = ClientArgs {
            server: Some("other.example:9000".to_string()),
            key: None,
            transport: Some(TransportKind::Kcp),
            tls_skip_verify: false,
            code: Some(code),
            config: None,
        };
        let opts = resolve_client_options(&args).await.unwrap();
        assert_eq!(opts.server, "other.example:9000");
        assert_eq!(opts.transport, TransportKind::Kcp);
    }

    #[tokio::test]
    async fn missing_identity_is_an_error() {
        let args = ClientArgs {
            server: Some("other.example:9000".to_string()),
            key: None,
            transport: None,
            tls_skip_verify: false,
            code: None,
            config: None,
        };
        assert!(resolve_client_options(&args).await.is_err());
    }
}
