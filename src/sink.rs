//! Metrics/event sink consumed by the administrative side.
//!
//! The core only emits; a deployment plugs in its own implementation to
//! persist counters and surface status transitions.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use tracing::info;

/// Status and counter events leaving the core.
pub trait EventSink: Send + Sync {
    fn client_online(&self, key: &str) {
        info!(client = key, "client online");
    }
    fn client_offline(&self, key: &str) {
        info!(client = key, "client offline");
    }
    fn tunnel_bound(&self, tunnel: u32, port: u16) {
        info!(tunnel, port, "tunnel bound");
    }
    fn tunnel_closed(&self, tunnel: u32) {
        info!(tunnel, "tunnel closed");
    }
    /// Session counters to be added onto stored totals.
    fn flow_persisted(&self, tunnel: u32, inbound: u64, outbound: u64) {
        info!(tunnel, inbound, outbound, "flow totals");
    }
    fn health_changed(&self, target: &str, up: bool) {
        info!(target, up, "health transition");
    }
}

/// The default sink: structured log lines only.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {}
