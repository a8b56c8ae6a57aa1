//! Cancellable one-shot delayed task
//!
//! Both schedulers are built on this: the owner arms a deadline, awaits
//! [`expired`] inside its `select!` loop, and cancels by clearing the
//! deadline. Cancelling never runs the task's side effect.

use std::future::pending;
use tokio::time::{sleep_until, Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct DelayedTask {
    deadline: Option<Instant>,
}

impl DelayedTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the task to fire at `deadline`
    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Arm (or re-arm) the task to fire after `delay`
    pub fn arm_after(&mut self, delay: Duration) {
        self.arm_at(Instant::now() + delay);
    }

    /// Disarm without firing. Returns whether the task was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Resolves when `deadline` passes; never resolves for `None`
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
