//! An intranet-penetration reverse tunneling bridge and client.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

mod arg;
mod client;
mod codec;
mod config;
mod http_head;
mod protocol;
mod proxy_proto;
mod rate;
mod relay;
mod server;
mod sink;
#[cfg(test)]
mod test;
mod tls;
mod transport;

use clap::Parser;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::{filter, fmt, prelude::*, reload};

/// Errors
#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Client(#[from] client::Error),
    #[error(transparent)]
    Bridge(#[from] server::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
}

const QUIET_QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::ERROR;
const QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::WARN;
const DEFAULT_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::INFO;
const VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::DEBUG;
const VERBOSE_VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::TRACE;

/// Real entry point
async fn main_real() -> Result<(), Error> {
    let reload_handle = {
        let fmt_layer = fmt::Layer::default()
            .compact()
            .with_timer(fmt::time::time())
            .with_writer(std::io::stderr);
        let (level_layer, reload_handle) = reload::Layer::new(DEFAULT_LOG_LEVEL);
        tracing_subscriber::registry()
            .with(level_layer)
            .with(fmt_layer)
            .init();
        reload_handle
    };
    let cli_args = arg::Cli::parse();
    match cli_args.verbose {
        0 => {}
        1 => reload_handle
            .reload(VERBOSE_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
        _ => reload_handle
            .reload(VERBOSE_VERBOSE_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
    };
    match cli_args.quiet {
        0 => {}
        1 => reload_handle
            .reload(QUIET_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
        _ => reload_handle
            .reload(QUIET_QUIET_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
    };
    match &cli_args.subcommand {
        arg::Commands::Bridge(args) => server::bridge_main(args).await?,
        arg::Commands::Client(args) => {
            let options = arg::resolve_client_options(args).await?;
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                stop_tx.send(true).ok();
            });
            client::client_main(options, stop_rx).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = main_real().await {
        error!("Giving up: {e}");
        std::process::exit(1);
    }
}
