//! Health check supervisor: active probes of client-side targets, with
//! transitions propagated to the bridge over the signal channel.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{HealthConfig, HealthMode};
use crate::protocol::{HealthEvent, SignalMsg};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Probe every target on the configured interval. `max_failures`
/// consecutive failures report the target down; the first success after
/// that reports it back up.
pub(super) async fn supervise(
    config: HealthConfig,
    sig_tx: mpsc::Sender<SignalMsg>,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures: HashMap<String, u32> = HashMap::new();
    let mut down: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = interval.tick() => {}
        }
        for target in &config.targets {
            let healthy = probe(&config, target).await;
            trace!(target, healthy, "probe");
            if healthy {
                failures.insert(target.clone(), 0);
                if down.remove(target) {
                    info!(target, "target recovered");
                    let event = SignalMsg::Health(HealthEvent {
                        target: target.clone(),
                        up: true,
                    });
                    if sig_tx.send(event).await.is_err() {
                        return;
                    }
                }
            } else {
                let count = failures.entry(target.clone()).or_insert(0);
                *count += 1;
                debug!(target, failures = *count, "probe failed");
                if *count >= config.max_failures && down.insert(target.clone()) {
                    info!(target, "target down");
                    let event = SignalMsg::Health(HealthEvent {
                        target: target.clone(),
                        up: false,
                    });
                    if sig_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn probe(config: &HealthConfig, target: &str) -> bool {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    match config.mode {
        HealthMode::Tcp => {
            // Dial and close.
            matches!(
                tokio::time::timeout(timeout, TcpStream::connect(target)).await,
                Ok(Ok(_))
            )
        }
        HealthMode::Http => tokio::time::timeout(timeout, http_probe(config, target))
            .await
            .unwrap_or(false),
    }
}

/// GET the configured path and require a 2xx status line.
async fn http_probe(config: &HealthConfig, target: &str) -> bool {
    let Ok(mut stream) = TcpStream::connect(target).await else {
        return false;
    };
    let path = if config.path.is_empty() {
        "/"
    } else {
        &config.path
    };
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }
    let mut status = [0_u8; 12];
    if stream.read_exact(&mut status).await.is_err() {
        return false;
    }
    // "HTTP/1.x 2xx"
    status.starts_with(b"HTTP/1.") && status[9] == b'2'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(targets: Vec<String>, mode: HealthMode) -> HealthConfig {
        HealthConfig {
            targets,
            mode,
            interval_secs: 1,
            timeout_secs: 1,
            max_failures: 2,
            path: String::new(),
        }
    }

    #[tokio::test]
    async fn tcp_probe_reflects_listener_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let keep = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        assert!(probe(&config(vec![], HealthMode::Tcp), &addr).await);
        keep.abort();
        // An unbound port fails fast.
        assert!(!probe(&config(vec![], HealthMode::Tcp), "127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn http_probe_requires_2xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0_u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    stream
                        .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                        .await
                        .ok();
                });
            }
        });
        assert!(probe(&config(vec![], HealthMode::Http), &addr).await);
    }

    #[tokio::test]
    async fn transitions_fire_after_max_failures() {
        let (sig_tx, mut sig_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        // Nothing listens on this target.
        let cfg = config(vec!["127.0.0.1:1".to_string()], HealthMode::Tcp);
        tokio::spawn(supervise(cfg, sig_tx, stop_rx));
        let msg = tokio::time::timeout(Duration::from_secs(10), sig_rx.recv())
            .await
            .expect("transition within a few probe intervals")
            .expect("channel open");
        match msg {
            SignalMsg::Health(event) => {
                assert_eq!(event.target, "127.0.0.1:1");
                assert!(!event.up);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
