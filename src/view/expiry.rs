//! Trailing-window expiry scheduling
//!
//! When a view only admits records whose timestamp lies within the last
//! `width_millis`, rows must be retracted purely because time passed. The
//! scheduler tracks the oldest in-window record and keeps a one-shot timer
//! armed for the instant it falls out of the window:
//!
//! ```text
//!            arm(Some(oldest))            timer elapses
//!   Idle ─────────────────────► Armed ─────────────────► Firing
//!    ▲                           │  ▲                      │
//!    │ arm(None)                 │  │ older row / oldest   │ recompute done:
//!    └───────────────────────────┘  └─ removed (re-arm)    │ arm(refreshed oldest)
//!    ◄─────────────────────────────────────────────────────┘
//! ```
//!
//! A row with timestamp `ts` is in the window at time `now` iff
//! `ts > now - width`, so it leaves at exactly `ts + width`.

use super::pipeline::{Filter, Pipeline, SortKey};
use super::timer::DelayedTask;
use super::types::Record;
use crate::store::FindOptions;
use serde_json::Value;
use tokio::time::{Duration, Instant};

/// Trailing window definition: `field` holds millisecond timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub field: String,
    pub width_millis: i64,
}

impl WindowSpec {
    pub fn new(field: &str, width_millis: i64) -> Self {
        Self {
            field: field.to_string(),
            width_millis,
        }
    }
}

/// Oldest record currently known to be inside the window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldestRow {
    pub key: String,
    pub timestamp: i64,
}

impl OldestRow {
    pub fn from_record(record: &Record, field: &str) -> Option<Self> {
        Some(Self {
            key: record.key.clone(),
            timestamp: record.timestamp(field)?,
        })
    }
}

/// Window bounds plus the oldest qualifying record
#[derive(Debug, Clone)]
pub struct MatchWindowState {
    pub field: String,
    pub width_millis: i64,
    pub oldest: Option<OldestRow>,
}

impl MatchWindowState {
    pub fn new(spec: &WindowSpec) -> Self {
        Self {
            field: spec.field.clone(),
            width_millis: spec.width_millis,
            oldest: None,
        }
    }

    /// Exclusive lower bound on the window field at `now`
    pub fn lower_bound(&self, now: i64) -> i64 {
        now - self.width_millis
    }

    pub fn contains(&self, timestamp: i64, now: i64) -> bool {
        timestamp > self.lower_bound(now)
    }

    /// Inject `field > now - width` into the pipeline's record match stage
    pub fn apply(&self, pipeline: &mut Pipeline, now: i64) {
        pipeline
            .record_match_mut()
            .set_lower_bound(&self.field, Value::from(self.lower_bound(now)));
    }

    /// Query for the oldest in-window record of an already bounded pipeline
    pub fn oldest_query(&self, pipeline: &Pipeline) -> (Filter, FindOptions) {
        let filter = pipeline.record_match().cloned().unwrap_or_default();
        let options = FindOptions {
            limit: Some(1),
            fields: vec![self.field.clone()],
            sort: vec![SortKey::asc(&self.field)],
        };
        (filter, options)
    }

    /// Milliseconds from `now` until `timestamp` leaves the window
    pub fn time_to_expiry(&self, timestamp: i64, now: i64) -> i64 {
        self.width_millis - (now - timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    Idle,
    Armed,
    Firing,
}

#[derive(Debug)]
pub struct ExpiryScheduler {
    window: MatchWindowState,
    state: ExpiryState,
    timer: DelayedTask,

    /// Tracked oldest row was removed from the source; needs a fresh query
    stale: bool,
}

impl ExpiryScheduler {
    pub fn new(spec: &WindowSpec) -> Self {
        Self {
            window: MatchWindowState::new(spec),
            state: ExpiryState::Idle,
            timer: DelayedTask::new(),
            stale: false,
        }
    }

    pub fn window(&self) -> &MatchWindowState {
        &self.window
    }

    pub fn state(&self) -> ExpiryState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Arm for `oldest` (or go idle when there is none). A row that is
    /// already out of the window arms an immediate fire.
    pub fn arm(&mut self, oldest: Option<OldestRow>, now: i64) {
        self.timer.cancel();
        self.stale = false;
        self.window.oldest = oldest;

        match &self.window.oldest {
            None => {
                self.state = ExpiryState::Idle;
            }
            Some(row) => {
                let delay = self.window.time_to_expiry(row.timestamp, now);
                if delay <= 0 {
                    self.timer.arm_at(Instant::now());
                } else {
                    self.timer.arm_after(Duration::from_millis(delay as u64));
                }
                log::debug!("⏰ Expiry armed for {} in {}ms", row.key, delay.max(0));
                self.state = ExpiryState::Armed;
            }
        }
    }

    /// Consume an elapsed timer; returns false if nothing was armed
    pub fn fire(&mut self) -> bool {
        if self.state != ExpiryState::Armed || !self.timer.cancel() {
            return false;
        }
        self.state = ExpiryState::Firing;
        true
    }

    /// An in-window record was added. Re-arms (returning true) when it
    /// becomes the new oldest row.
    pub fn observe_added(&mut self, key: &str, timestamp: i64, now: i64) -> bool {
        if !self.window.contains(timestamp, now) {
            return false;
        }
        let older = match &self.window.oldest {
            None => true,
            Some(oldest) => timestamp < oldest.timestamp,
        };
        if older {
            self.arm(
                Some(OldestRow {
                    key: key.to_string(),
                    timestamp,
                }),
                now,
            );
        }
        older
    }

    /// A record was removed. Returns true when it was the tracked oldest row,
    /// in which case the oldest row must be re-derived.
    pub fn observe_removed(&mut self, key: &str) -> bool {
        let was_oldest = self
            .window
            .oldest
            .as_ref()
            .map_or(false, |oldest| oldest.key == key);
        if was_oldest {
            self.stale = true;
        }
        was_oldest
    }

    /// Whether the next recompute must re-derive the oldest row
    pub fn needs_refresh(&self) -> bool {
        self.stale || self.window.oldest.is_none()
    }

    /// A recompute failed while firing: stay idle until something re-arms us
    pub fn abandon(&mut self) {
        self.timer.cancel();
        self.stale = true;
        self.state = ExpiryState::Idle;
    }

    /// Disarm without firing
    pub fn cancel(&mut self) {
        self.timer.cancel();
        self.state = ExpiryState::Idle;
    }
}
