//! Token-bucket rate limiting and per-tunnel traffic accounting.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A byte-rate limiter: capacity equals the refill rate, so a full second
/// of traffic can burst through an idle bucket.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<DirectLimiter>,
    burst: u32,
}

impl RateLimiter {
    /// `bytes_per_sec == 0` means unlimited.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
        match NonZeroU32::new(rate) {
            Some(rate) => Self {
                bucket: Some(governor::RateLimiter::direct(
                    Quota::per_second(rate).allow_burst(rate),
                )),
                burst: rate.get(),
            },
            None => Self {
                bucket: None,
                burst: 0,
            },
        }
    }

    /// Wait until `n` bytes of credit are available. Not an error
    /// condition; callers simply stall.
    pub async fn acquire(&self, n: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let mut remaining = n as u64;
        while remaining > 0 {
            let take = remaining.min(u64::from(self.burst)) as u32;
            let take = NonZeroU32::new(take).expect("chunk is non-zero (this is a bug)");
            // Cannot fail: `take` never exceeds the bucket capacity.
            bucket
                .until_n_ready(take)
                .await
                .expect("rate chunk exceeds bucket capacity (this is a bug)");
            remaining -= u64::from(take.get());
        }
    }
}

/// The per-tunnel byte quota was passed.
#[derive(Debug, Error)]
#[error("traffic quota exceeded")]
pub struct QuotaExceeded;

/// Traffic totals for one tunnel (or one client). Counters only grow
/// within a session; the persistence side adds them onto stored totals.
#[derive(Debug, Default)]
pub struct Flow {
    pub inbound: AtomicU64,
    pub outbound: AtomicU64,
    /// Byte quota over `inbound + outbound`; 0 is unlimited.
    pub quota: u64,
}

impl Flow {
    #[must_use]
    pub fn new(quota: u64) -> Self {
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            quota,
        }
    }

    /// Record transferred bytes, failing once the aggregate passes the
    /// quota. The write that crosses the line still counts: overshoot is
    /// bounded by the copy buffer.
    pub fn add(&self, inbound: u64, outbound: u64) -> Result<(), QuotaExceeded> {
        let in_total = self.inbound.fetch_add(inbound, Ordering::Relaxed) + inbound;
        let out_total = self.outbound.fetch_add(outbound, Ordering::Relaxed) + outbound;
        if self.quota > 0 && in_total + out_total > self.quota {
            return Err(QuotaExceeded);
        }
        Ok(())
    }

    /// Whether the quota is already spent.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.quota > 0
            && self.inbound.load(Ordering::Relaxed) + self.outbound.load(Ordering::Relaxed)
                > self.quota
    }

    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.inbound.load(Ordering::Relaxed),
            self.outbound.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn unlimited_limiter_never_stalls() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn bucket_grants_burst_then_paces() {
        let limiter = RateLimiter::new(2048);
        let start = Instant::now();
        // A full bucket hands out one second of credit immediately.
        limiter.acquire(2048).await;
        assert!(start.elapsed() < Duration::from_millis(200));
        // The next half-bucket has to be refilled at the configured rate.
        limiter.acquire(1024).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn acquire_larger_than_burst_is_chunked() {
        let limiter = RateLimiter::new(1 << 20);
        // Three bucketfuls: must not panic, must take about two seconds.
        let start = Instant::now();
        limiter.acquire(3 << 20).await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[test]
    fn quota_trips_on_the_crossing_write() {
        let flow = Flow::new(1000);
        assert!(flow.add(600, 0).is_ok());
        assert!(flow.add(0, 400).is_ok());
        assert!(!flow.exhausted());
        assert!(flow.add(1, 0).is_err());
        assert!(flow.exhausted());
        // Counters keep the overshoot; persistence adds them as-is.
        assert_eq!(flow.totals(), (601, 400));
    }

    #[test]
    fn zero_quota_is_unlimited() {
        let flow = Flow::new(0);
        assert!(flow.add(u64::from(u32::MAX), u64::from(u32::MAX)).is_ok());
        assert!(!flow.exhausted());
    }
}
