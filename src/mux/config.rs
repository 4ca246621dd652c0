//! Multiplexer tunables.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Initial per-stream receive window advertised to the peer, in bytes.
pub const DEFAULT_RWND: u32 = 4 * 1024 * 1024;

/// Interval between keepalive `Ping` frames.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How long we tolerate not seeing a `Pong` before declaring the peer dead.
/// Two keepalive intervals, i.e. two missed `Pong`s.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Backlog of accepted-but-unclaimed incoming streams.
pub const ACCEPT_BACKLOG: usize = 64;

/// Multiplexer options.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Interval between keepalive `Ping`s. `None` disables keepalives
    /// and the liveness check (used by loopback tests).
    pub keepalive_interval: Option<Duration>,
    /// Missing `Pong`s for this long closes the multiplexer.
    pub disconnect_timeout: Duration,
    /// Initial receive window advertised for every new stream.
    pub rwnd: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            rwnd: DEFAULT_RWND,
        }
    }
}

impl MuxConfig {
    /// Override the liveness timeout, keeping the other defaults.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}
