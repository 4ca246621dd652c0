//! Optional interval timers for keepalives.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// A `Duration` that may be absent. Converting into [`OptionalInterval`]
/// yields a timer that never fires when the duration is `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalDuration(Option<Duration>);

impl From<Option<Duration>> for OptionalDuration {
    #[inline]
    fn from(d: Option<Duration>) -> Self {
        Self(d)
    }
}

impl From<Duration> for OptionalDuration {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(Some(d))
    }
}

/// An interval timer that may never fire.
#[derive(Debug)]
pub struct OptionalInterval(Option<Interval>);

impl From<OptionalDuration> for OptionalInterval {
    fn from(d: OptionalDuration) -> Self {
        Self(d.0.map(tokio::time::interval))
    }
}

impl OptionalInterval {
    /// See [`Interval::set_missed_tick_behavior`].
    pub fn set_missed_tick_behavior(&mut self, behavior: MissedTickBehavior) {
        if let Some(interval) = &mut self.0 {
            interval.set_missed_tick_behavior(behavior);
        }
    }

    /// Completes on the next tick, or never if no duration was configured.
    pub async fn tick(&mut self) -> Instant {
        match &mut self.0 {
            Some(interval) => interval.tick().await,
            None => futures_util::future::pending().await,
        }
    }
}
