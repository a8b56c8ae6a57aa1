//! # Incremental View Reconciliation
//!
//! Publishes a grouped/aggregated view over a mutable record store as a
//! stream of incremental `added` / `changed` / `removed` events.
//!
//! ## Architecture
//!
//! ```text
//! SourceStore ──change feed──► ViewActor (one task per publication)
//!                                 ├─ RecomputeThrottle  (trailing-edge)
//!                                 ├─ ExpiryScheduler    (trailing window)
//!                                 ├─ PipelineExecutor   (spawned job)
//!                                 ├─ Reconciler ──► IdentityManager + ViewSnapshot
//!                                 └─ ViewSink           (downstream)
//! ```
//!
//! **Key Principle:** the published view is only ever changed by applying a
//! complete reconciliation pass. Failed recomputes leave the last published
//! state in place.
//!
//! A rebuild (explicit, or driven by the rebuild trigger feed) retracts every
//! row, advances the identity generation and starts over with a freshly built
//! pipeline, so no identifier survives into the rebuilt view.
//!
//! ## Module Organization
//!
//! - `types` - Records, grouping keys, output identifiers, rows, events
//! - `identity` - Grouping key to output identifier mapping
//! - `snapshot` - Last-published comparison values
//! - `reconcile` - Minimal edit script computation
//! - `timer` - Cancellable delayed task
//! - `throttle` - Trailing-edge recompute throttle
//! - `expiry` - Trailing-window expiry scheduling
//! - `pipeline` - Typed pipeline definitions and filters
//! - `controller` - Publication lifecycle (start, rebuild, stop)
//! - `sink` - Downstream publish contract
//! - `options` / `config` - Library options and runtime configuration

pub mod config;
pub mod controller;
pub mod error;
pub mod expiry;
pub mod identity;
pub mod options;
pub mod pipeline;
pub mod reconcile;
pub mod sink;
pub mod snapshot;
pub mod throttle;
pub mod timer;
pub mod types;

pub use controller::{ViewHandle, ViewPublication};
pub use error::{ConstructionError, ViewError};
pub use options::{RebuildTrigger, ViewOptions};
pub use sink::{ChannelSink, ViewSink};
pub use types::{OutputId, Record, ResultRow, ViewEvent};
