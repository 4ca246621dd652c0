//! The client registry: identity lookup, signal-channel and data-channel
//! installation, and supersession of stale registrations.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::ClientRecord;
use crate::protocol::{key_digest, SignalMsg};
use crate::rate::{Flow, RateLimiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use warren_mux::Multiplexor;

/// A live signal channel: where to queue outbound control messages and
/// how to cancel the session that owns the connection.
#[derive(Debug, Clone)]
pub struct SignalHandle {
    pub tx: mpsc::Sender<SignalMsg>,
    cancel: watch::Sender<bool>,
}

impl SignalHandle {
    pub fn new(tx: mpsc::Sender<SignalMsg>) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        (Self { tx, cancel }, cancelled)
    }

    /// Tear down the owning session.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }
}

/// Everything the bridge knows about one client identity.
#[derive(Debug)]
pub struct ClientHandle {
    /// 32-char hex identity used on the wire.
    pub digest: String,
    /// The raw verify key; also the codec key material.
    pub verify_key: String,
    pub record: ClientRecord,
    pub rate: Arc<RateLimiter>,
    /// Client-level counters and quota, across all its tunnels.
    pub flow: Arc<Flow>,
    signal: Mutex<Option<SignalHandle>>,
    mux: Mutex<Option<Arc<Multiplexor>>>,
    last_seen: Mutex<Instant>,
    /// Source IPs bound by `RGST`, with their expiry.
    registered_ips: Mutex<HashMap<IpAddr, Instant>>,
}

impl ClientHandle {
    fn new(record: ClientRecord) -> Self {
        Self {
            digest: key_digest(&record.verify_key),
            verify_key: record.verify_key.clone(),
            rate: Arc::new(RateLimiter::new(record.rate_limit)),
            flow: Arc::new(Flow::new(record.flow_quota)),
            record,
            signal: Mutex::new(None),
            mux: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            registered_ips: Mutex::new(HashMap::new()),
        }
    }

    /// Install a new signal channel, tearing down the prior signal channel
    /// and data multiplexer. Idempotent from the client's point of view.
    pub fn install_signal(&self, handle: SignalHandle) {
        let old_signal = self.signal.lock().replace(handle);
        let old_mux = self.mux.lock().take();
        if let Some(old) = old_signal {
            debug!(client = %self.digest, "superseding prior signal channel");
            old.close();
        }
        if let Some(old) = old_mux {
            old.close();
        }
        self.touch();
    }

    /// Install a new data multiplexer, superseding any prior one.
    pub fn install_mux(&self, mux: Arc<Multiplexor>) {
        if let Some(old) = self.mux.lock().replace(mux) {
            debug!(client = %self.digest, "superseding prior data channel");
            old.close();
        }
        self.touch();
    }

    /// Drop the registration state for a finished session. Only clears if
    /// the stored handles are the ones being released.
    pub fn clear_signal(&self, tx: &mpsc::Sender<SignalMsg>) {
        let mut slot = self.signal.lock();
        if slot.as_ref().is_some_and(|s| s.tx.same_channel(tx)) {
            *slot = None;
            if let Some(old) = self.mux.lock().take() {
                old.close();
            }
        }
    }

    #[must_use]
    pub fn signal_tx(&self) -> Option<mpsc::Sender<SignalMsg>> {
        self.signal.lock().as_ref().map(|s| s.tx.clone())
    }

    #[must_use]
    pub fn mux(&self) -> Option<Arc<Multiplexor>> {
        let mut slot = self.mux.lock();
        if slot.as_ref().is_some_and(|m| m.is_closed()) {
            *slot = None;
        }
        slot.clone()
    }

    #[must_use]
    pub fn online(&self) -> bool {
        self.signal.lock().is_some()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Bind a source IP to this identity for a TTL (`RGST`).
    pub fn register_ip(&self, ip: IpAddr, ttl: Duration) {
        self.registered_ips
            .lock()
            .insert(ip, Instant::now() + ttl);
    }

    #[must_use]
    pub fn ip_registered(&self, ip: IpAddr) -> bool {
        let mut ips = self.registered_ips.lock();
        ips.retain(|_, expiry| *expiry > Instant::now());
        ips.contains_key(&ip)
    }
}

/// O(1) lookup of clients by key digest. One mutex, short critical
/// sections: lookup, insert, evict.
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, Arc<ClientHandle>>>,
}

impl Registry {
    #[must_use]
    pub fn from_config(records: &[ClientRecord]) -> Self {
        let registry = Self::default();
        {
            let mut clients = registry.clients.lock();
            for record in records {
                if !record.enabled {
                    continue;
                }
                let handle = Arc::new(ClientHandle::new(record.clone()));
                clients.insert(handle.digest.clone(), handle);
            }
        }
        registry
    }

    #[must_use]
    pub fn get(&self, digest: &str) -> Option<Arc<ClientHandle>> {
        self.clients.lock().get(digest).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Reconcile with a fresh snapshot: evict clients that disappeared or
    /// were disabled (tearing down their channels), insert new ones.
    /// Existing handles keep their live state.
    pub fn sync(&self, records: &[ClientRecord]) {
        let mut clients = self.clients.lock();
        let mut evicted = Vec::new();
        clients.retain(|digest, handle| {
            let keep = records
                .iter()
                .any(|r| r.enabled && key_digest(&r.verify_key) == *digest);
            if !keep {
                evicted.push(handle.clone());
            }
            keep
        });
        for record in records {
            if !record.enabled {
                continue;
            }
            let digest = key_digest(&record.verify_key);
            clients
                .entry(digest)
                .or_insert_with(|| Arc::new(ClientHandle::new(record.clone())));
        }
        drop(clients);
        for handle in evicted {
            debug!(client = %handle.digest, "evicted by config reload");
            if let Some(signal) = handle.signal.lock().take() {
                signal.close();
            }
            if let Some(mux) = handle.mux.lock().take() {
                mux.close();
            }
        }
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.clients
            .lock()
            .values()
            .filter(|handle| handle.online())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str) -> ClientRecord {
        serde_json::from_str(&format!("{{\"verify_key\": \"{key}\"}}")).unwrap()
    }

    #[tokio::test]
    async fn lookup_is_by_digest() {
        let registry = Registry::from_config(&[record("abc123def0")]);
        let digest = key_digest("abc123def0");
        assert!(registry.get(&digest).is_some());
        assert!(registry.get("0000000000000000000000000000dead").is_none());
    }

    #[tokio::test]
    async fn disabled_clients_are_not_registered() {
        let mut rec = record("abc123def0");
        rec.enabled = false;
        let registry = Registry::from_config(&[rec]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reregistration_supersedes_and_closes_the_old_channel() {
        let registry = Registry::from_config(&[record("abc123def0")]);
        let handle = registry.get(&key_digest("abc123def0")).unwrap();
        let (tx1, _rx1) = mpsc::channel(8);
        let (signal1, mut cancelled1) = SignalHandle::new(tx1);
        handle.install_signal(signal1);
        assert!(handle.online());
        // Concurrent re-registrations: exactly one survivor, the prior
        // session is cancelled.
        let (tx2, _rx2) = mpsc::channel(8);
        let (signal2, mut cancelled2) = SignalHandle::new(tx2.clone());
        handle.install_signal(signal2);
        assert!(cancelled1.has_changed().unwrap());
        assert!(!cancelled2.has_changed().unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.online_count(), 1);
        // Releasing with a stale sender is a no-op.
        let (tx_stale, _rx) = mpsc::channel(8);
        handle.clear_signal(&tx_stale);
        assert!(handle.online());
        handle.clear_signal(&tx2);
        assert!(!handle.online());
    }

    #[tokio::test]
    async fn register_ip_expires() {
        let registry = Registry::from_config(&[record("abc123def0")]);
        let handle = registry.get(&key_digest("abc123def0")).unwrap();
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        handle.register_ip(ip, Duration::from_millis(20));
        assert!(handle.ip_registered(ip));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.ip_registered(ip));
    }
}
