//! The dispatcher: tunnel handles, host routing, and health-aware
//! round-robin target selection.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{ClientRecord, TunnelMode, TunnelRecord};
use crate::protocol::key_digest;
use crate::rate::Flow;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Round-robin pool over a tunnel's target candidates, skipping targets
/// the health supervisor reported down.
#[derive(Debug)]
pub struct TargetPool {
    targets: Vec<String>,
    next: AtomicUsize,
    down: RwLock<HashSet<String>>,
}

impl TargetPool {
    #[must_use]
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets,
            next: AtomicUsize::new(0),
            down: RwLock::new(HashSet::new()),
        }
    }

    /// Next healthy target, or `None` when every candidate is down.
    #[must_use]
    pub fn select(&self) -> Option<String> {
        if self.targets.is_empty() {
            return None;
        }
        let down = self.down.read();
        for _ in 0..self.targets.len() {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
            let target = &self.targets[idx];
            if !down.contains(target) {
                return Some(target.clone());
            }
        }
        None
    }

    /// Apply a health transition. Unknown targets are ignored.
    pub fn mark(&self, target: &str, up: bool) {
        if !self.targets.iter().any(|t| t == target) {
            return;
        }
        let mut down = self.down.write();
        if up {
            down.remove(target);
        } else {
            down.insert(target.to_string());
        }
    }

    #[must_use]
    pub fn contains(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }
}

/// One bound tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    pub record: TunnelRecord,
    /// Identity digest of the owning client.
    pub client_digest: String,
    pub flow: Arc<Flow>,
    pub targets: TargetPool,
    pub whitelist: Arc<RwLock<HashSet<IpAddr>>>,
    pub whitelist_password: String,
    /// Enforcement is decided by the configured list, not the grown one.
    pub whitelist_enabled: bool,
    /// Flipped when the tunnel is unbound; listener tasks watch it.
    shutdown: watch::Sender<bool>,
}

impl TunnelHandle {
    #[must_use]
    pub fn new(record: TunnelRecord, owner: &ClientRecord) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            client_digest: key_digest(&owner.verify_key),
            flow: Arc::new(Flow::new(record.quota)),
            targets: TargetPool::new(record.targets.clone()),
            whitelist: Arc::new(RwLock::new(owner.whitelist.iter().copied().collect())),
            whitelist_password: owner.whitelist_password.clone(),
            whitelist_enabled: !owner.whitelist.is_empty(),
            record,
            shutdown,
        })
    }

    #[must_use]
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Routes public traffic to tunnels: by ID, by hostname, by secret and by
/// P2P password hash.
#[derive(Debug, Default)]
pub struct Dispatcher {
    tunnels: RwLock<HashMap<u32, Arc<TunnelHandle>>>,
    hosts: RwLock<HashMap<String, Arc<TunnelHandle>>>,
    secrets: RwLock<HashMap<String, Arc<TunnelHandle>>>,
    p2p: RwLock<HashMap<String, Arc<TunnelHandle>>>,
}

impl Dispatcher {
    pub fn register(&self, tunnel: Arc<TunnelHandle>) {
        match tunnel.record.mode {
            TunnelMode::HostProxy => {
                self.hosts
                    .write()
                    .insert(tunnel.record.host.to_ascii_lowercase(), tunnel.clone());
            }
            TunnelMode::Secret => {
                self.secrets
                    .write()
                    .insert(key_digest(&tunnel.record.secret_password), tunnel.clone());
            }
            TunnelMode::P2p => {
                self.p2p
                    .write()
                    .insert(key_digest(&tunnel.record.p2p_password), tunnel.clone());
            }
            _ => {}
        }
        self.tunnels.write().insert(tunnel.record.id, tunnel);
    }

    /// Unbind one tunnel and flip its shutdown signal.
    pub fn remove(&self, id: u32) -> Option<Arc<TunnelHandle>> {
        let tunnel = self.tunnels.write().remove(&id)?;
        match tunnel.record.mode {
            TunnelMode::HostProxy => {
                self.hosts
                    .write()
                    .remove(&tunnel.record.host.to_ascii_lowercase());
            }
            TunnelMode::Secret => {
                self.secrets
                    .write()
                    .remove(&key_digest(&tunnel.record.secret_password));
            }
            TunnelMode::P2p => {
                self.p2p
                    .write()
                    .remove(&key_digest(&tunnel.record.p2p_password));
            }
            _ => {}
        }
        tunnel.close();
        Some(tunnel)
    }

    /// Unbind everything owned by one client (client loss or reconfig).
    pub fn remove_client(&self, client_digest: &str) {
        let ids: Vec<u32> = self
            .tunnels
            .read()
            .values()
            .filter(|t| t.client_digest == client_digest)
            .map(|t| t.record.id)
            .collect();
        for id in ids {
            self.remove(id);
        }
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<TunnelHandle>> {
        self.tunnels.read().get(&id).cloned()
    }

    #[must_use]
    pub fn by_host(&self, host: &str) -> Option<Arc<TunnelHandle>> {
        // Hosts route with and without an explicit port.
        let host = host.to_ascii_lowercase();
        let hosts = self.hosts.read();
        hosts
            .get(&host)
            .or_else(|| hosts.get(host.split(':').next().unwrap_or(&host)))
            .cloned()
    }

    #[must_use]
    pub fn by_secret(&self, password_digest: &str) -> Option<Arc<TunnelHandle>> {
        self.secrets.read().get(password_digest).cloned()
    }

    #[must_use]
    pub fn by_p2p_password(&self, password_digest: &str) -> Option<Arc<TunnelHandle>> {
        self.p2p.read().get(password_digest).cloned()
    }

    #[must_use]
    pub fn count_for_client(&self, client_digest: &str) -> u32 {
        self.tunnels
            .read()
            .values()
            .filter(|t| t.client_digest == client_digest)
            .count() as u32
    }

    /// Apply a health transition to every pool of the client that carries
    /// the probed target.
    pub fn mark_target(&self, client_digest: &str, target: &str, up: bool) {
        debug!(client = client_digest, target, up, "health mark");
        for tunnel in self.tunnels.read().values() {
            if tunnel.client_digest == client_digest && tunnel.targets.contains(target) {
                tunnel.targets.mark(target, up);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn fixture() -> (Dispatcher, String) {
        let config: BridgeConfig = serde_json::from_str(
            r#"{
                "bridge_port": 8024,
                "clients": [{
                    "verify_key": "abc123def0",
                    "tunnels": [
                        {"id": 1, "mode": "tcp", "port": 7001, "targets": ["127.0.0.1:9001"]},
                        {"id": 2, "mode": "hostProxy", "host": "A.Example",
                         "targets": ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]},
                        {"id": 3, "mode": "secret", "secret_password": "sesame",
                         "targets": ["127.0.0.1:22"]}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let dispatcher = Dispatcher::default();
        let owner = &config.clients[0];
        for record in &owner.tunnels {
            dispatcher.register(TunnelHandle::new(record.clone(), owner));
        }
        (dispatcher, key_digest("abc123def0"))
    }

    #[test]
    fn round_robin_rotates() {
        let (dispatcher, _) = fixture();
        let tunnel = dispatcher.by_host("a.example").unwrap();
        let first = tunnel.targets.select().unwrap();
        let second = tunnel.targets.select().unwrap();
        let third = tunnel.targets.select().unwrap();
        let fourth = tunnel.targets.select().unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    fn health_down_removes_from_rotation_until_recovery() {
        let (dispatcher, digest) = fixture();
        let tunnel = dispatcher.by_host("a.example:80").unwrap();
        dispatcher.mark_target(&digest, "10.0.0.2:80", false);
        for _ in 0..6 {
            assert_ne!(tunnel.targets.select().unwrap(), "10.0.0.2:80");
        }
        dispatcher.mark_target(&digest, "10.0.0.2:80", true);
        let picked: Vec<String> = (0..3).map(|_| tunnel.targets.select().unwrap()).collect();
        assert!(picked.contains(&"10.0.0.2:80".to_string()));
        // All down: nothing to select.
        for target in ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"] {
            dispatcher.mark_target(&digest, target, false);
        }
        assert!(tunnel.targets.select().is_none());
    }

    #[test]
    fn secret_lookup_is_by_password_digest() {
        let (dispatcher, _) = fixture();
        assert!(dispatcher.by_secret(&key_digest("sesame")).is_some());
        assert!(dispatcher.by_secret(&key_digest("wrong")).is_none());
    }

    #[test]
    fn remove_client_unbinds_everything() {
        let (dispatcher, digest) = fixture();
        let tunnel = dispatcher.get(1).unwrap();
        let mut shutdown = tunnel.shutdown_rx();
        dispatcher.remove_client(&digest);
        assert!(dispatcher.get(1).is_none());
        assert!(dispatcher.by_host("a.example").is_none());
        assert_eq!(dispatcher.count_for_client(&digest), 0);
        assert!(shutdown.has_changed().unwrap());
    }
}
