//! Diff reconciler
//!
//! Turns a freshly computed result set into the minimal add / change / remove
//! edit script against the last-published snapshot, updating the snapshot and
//! releasing identifiers of retracted rows on the way.
//!
//! ```text
//! rows ──► IdentityManager::get_id ──► ViewSnapshot lookup
//!            │                            │
//!            │        absent ─────────────┼──► Added
//!            │        scalar differs ─────┼──► Changed   (single-value mode only)
//!            ▼                            │
//!   snapshot ids not seen this pass ──────┴──► Removed + release_id
//! ```

use super::identity::IdentityManager;
use super::snapshot::{PublishedValue, ViewSnapshot};
use super::types::{OutputId, ResultRow};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Post-processing applied to emitted rows only (never to comparison values)
pub type RowTransform = Arc<dyn Fn(&ResultRow) -> Value + Send + Sync>;

/// How a published row is compared between passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Presence only: rows are added and removed, never changed
    Presence,

    /// Compare the named scalar field; a difference emits `Changed`
    Field(String),
}

impl Comparison {
    pub fn single_value_field(&self) -> Option<&str> {
        match self {
            Comparison::Presence => None,
            Comparison::Field(field) => Some(field),
        }
    }

    fn extract(&self, row: &ResultRow) -> PublishedValue {
        match self {
            Comparison::Presence => PublishedValue::Present,
            Comparison::Field(field) => {
                PublishedValue::Scalar(row.get(field).cloned().unwrap_or(Value::Null))
            }
        }
    }
}

/// One step of the edit script
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Added { id: OutputId, row: Value },
    Changed { id: OutputId, row: Value },
    Removed { id: OutputId },
}

/// Reconciles result sets against a snapshot using one identity space
pub struct Reconciler<'a> {
    pub identities: &'a mut IdentityManager,
    pub snapshot: &'a mut ViewSnapshot,
    pub comparison: &'a Comparison,
    pub transform: Option<&'a RowTransform>,
}

impl<'a> Reconciler<'a> {
    /// Diff `rows` against the snapshot. Row order follows the pipeline output;
    /// removals come last, in identifier mint order.
    pub fn reconcile(&mut self, rows: Vec<ResultRow>) -> Vec<Delta> {
        let mut deltas = Vec::new();
        let mut seen = HashSet::with_capacity(rows.len());

        for row in rows {
            let id = self.identities.get_id(&row.grouping_key());
            seen.insert(id);
            let value = self.comparison.extract(&row);

            match self.snapshot.get(&id) {
                None => {
                    deltas.push(Delta::Added {
                        id,
                        row: self.emitted(&row),
                    });
                    self.snapshot.insert(id, value);
                }
                Some(previous) => {
                    if let Comparison::Field(_) = self.comparison {
                        if *previous != value {
                            deltas.push(Delta::Changed {
                                id,
                                row: self.emitted(&row),
                            });
                            self.snapshot.insert(id, value);
                        }
                    } else {
                        self.snapshot.insert(id, PublishedValue::Present);
                    }
                }
            }
        }

        for id in self.snapshot.ids() {
            if !seen.contains(&id) {
                self.snapshot.remove(&id);
                self.identities.release_id(&id);
                deltas.push(Delta::Removed { id });
            }
        }
        self.snapshot.purge_stale();

        deltas
    }

    fn emitted(&self, row: &ResultRow) -> Value {
        match self.transform {
            Some(transform) => transform(row),
            None => Value::Object(row.to_document()),
        }
    }
}
