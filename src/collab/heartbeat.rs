//! Timing primitives for the check loop: interval timers with a self-check,
//! heartbeat staleness tracking and reconnect backoff.

use std::time::{Duration, Instant};

/// A tick is late when the gap since the previous firing exceeds this
/// multiple of the interval.
pub const LATE_TICK_FACTOR: u32 = 3;
/// Consecutive late ticks after which a timer is considered broken.
pub const MAX_BAD_TICKS: u32 = 5;
/// A peer is silent once no status arrived for this multiple of its
/// heartbeat interval.
pub const STALE_INTERVAL_FACTOR: u32 = 5;
/// Consecutive silent check cycles that make a soft failure.
pub const STALE_CYCLES_LIMIT: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickHealth {
    OnTime,
    Late { consecutive: u32 },
    Failed { consecutive: u32 },
}

#[derive(Debug)]
pub struct IntervalTimer {
    name: &'static str,
    interval: Duration,
    next_due: Instant,
    last_fired: Option<Instant>,
    bad_ticks: u32,
}

impl IntervalTimer {
    /// The first tick is due immediately.
    pub fn new(name: &'static str, interval: Duration, now: Instant) -> Self {
        Self {
            name,
            interval,
            next_due: now,
            last_fired: None,
            bad_ticks: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        if interval == self.interval {
            return;
        }
        self.interval = interval;
        if let Some(last) = self.last_fired {
            self.next_due = last + interval;
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn fire(&mut self, now: Instant) -> TickHealth {
        let late = self.last_fired.is_some_and(|last| {
            now.saturating_duration_since(last) > self.interval * LATE_TICK_FACTOR
        });
        self.last_fired = Some(now);
        self.next_due = now + self.interval;

        if !late {
            self.bad_ticks = 0;
            return TickHealth::OnTime;
        }
        self.bad_ticks += 1;
        if self.bad_ticks >= MAX_BAD_TICKS {
            TickHealth::Failed {
                consecutive: self.bad_ticks,
            }
        } else {
            TickHealth::Late {
                consecutive: self.bad_ticks,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale { cycles: u32 },
    /// The limit was reached; the counter starts over.
    SoftFailure,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StalenessTracker {
    stale_cycles: u32,
}

impl StalenessTracker {
    pub fn observe(&mut self, silent_for: Duration, heartbeat_interval: Duration) -> Staleness {
        if silent_for <= heartbeat_interval * STALE_INTERVAL_FACTOR {
            self.stale_cycles = 0;
            return Staleness::Fresh;
        }
        self.stale_cycles += 1;
        if self.stale_cycles >= STALE_CYCLES_LIMIT {
            self.stale_cycles = 0;
            Staleness::SoftFailure
        } else {
            Staleness::Stale {
                cycles: self.stale_cycles,
            }
        }
    }

    pub fn stale_cycles(&self) -> u32 {
        self.stale_cycles
    }

    pub fn reset(&mut self) {
        self.stale_cycles = 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
