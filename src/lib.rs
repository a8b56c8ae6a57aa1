//! Incrementally reconciled aggregation views.
//!
//! `view` holds the reconciliation engine (identity, snapshot, diffing,
//! throttled recompute, trailing-window expiry, lifecycle). `store` holds the
//! collaborator traits the engine consumes plus two reference stores.

pub mod store;
pub mod view;
