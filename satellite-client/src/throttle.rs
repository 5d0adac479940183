//! Leading+trailing throttle as an explicit state machine.
//!
//! The first call in an idle window runs immediately (leading edge) and
//! opens a window of length `period`. Calls made while the window is open
//! schedule exactly one run at the end of the window (trailing edge); later
//! calls in the same window are covered by that scheduled run.

use std::time::Duration;
use tokio::time::Instant;

/// What the caller should do after [`Throttle::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Run now.
    RunNow,
    /// Arm a timer that fires after the given delay, then call [`Throttle::fire`].
    Schedule(Duration),
    /// A trailing run is already scheduled.
    Covered,
}

#[derive(Debug)]
pub struct Throttle {
    period: Duration,
    last_run: Option<Instant>,
    trailing_scheduled: bool,
}

impl Throttle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_run: None,
            trailing_scheduled: false,
        }
    }

    pub fn call(&mut self, now: Instant) -> ThrottleAction {
        if self.trailing_scheduled {
            return ThrottleAction::Covered;
        }
        match self.last_run {
            Some(last) if now.duration_since(last) < self.period => {
                self.trailing_scheduled = true;
                ThrottleAction::Schedule(self.period - now.duration_since(last))
            }
            _ => {
                self.last_run = Some(now);
                ThrottleAction::RunNow
            }
        }
    }

    /// Records that the scheduled trailing run is executing.
    pub fn fire(&mut self, now: Instant) {
        self.trailing_scheduled = false;
        self.last_run = Some(now);
    }

    pub fn is_scheduled(&self) -> bool {
        self.trailing_scheduled
    }
}
