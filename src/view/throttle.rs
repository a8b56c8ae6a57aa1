//! Recompute scheduler (trailing-edge throttle)
//!
//! The first `trigger()` in a quiet period arms a deadline one interval out;
//! further triggers before that deadline are coalesced into it. When the
//! deadline fires exactly one recompute runs, and since it reads the store at
//! that moment it reflects the most recent request.

use super::timer::DelayedTask;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct RecomputeThrottle {
    interval: Duration,
    task: DelayedTask,

    /// Triggers absorbed into the currently pending run
    coalesced: u64,
}

impl RecomputeThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: DelayedTask::new(),
            coalesced: 0,
        }
    }

    pub fn from_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// Request a recompute at the end of the current interval
    pub fn trigger(&mut self) {
        if self.task.is_armed() {
            self.coalesced += 1;
            return;
        }
        self.task.arm_after(self.interval);
    }

    /// Drop the pending run without executing it
    pub fn cancel(&mut self) {
        self.task.cancel();
        self.coalesced = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.task.is_armed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.task.deadline()
    }

    /// Consume the pending run once its deadline passed.
    ///
    /// Returns how many extra triggers were folded into it, or `None` if
    /// nothing was pending.
    pub fn fire(&mut self) -> Option<u64> {
        if !self.task.cancel() {
            return None;
        }
        Some(std::mem::take(&mut self.coalesced))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
