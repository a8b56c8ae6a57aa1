//! Source store and pipeline execution collaborators
//!
//! The reconciliation engine only talks to these traits:
//!
//! - [`SourceStore`] - record lookup (`find`) and change notifications
//!   (`subscribe_changes`)
//! - [`PipelineExecutor`] - runs a [`Pipeline`] and returns grouped rows
//!
//! Two reference implementations are provided: [`MemoryStore`] and
//! [`SqliteStore`]. Both implement both traits and share the change-feed
//! fan-out in [`feed`].

pub mod executor;
pub mod feed;
pub mod memory;
pub mod sqlite;

use crate::view::pipeline::{Filter, Pipeline, SortKey};
use crate::view::types::{Record, ResultRow};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use feed::FeedRegistry;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug)]
pub enum StoreError {
    Database(String),
    Serialization(serde_json::Error),
    /// A store mutex was poisoned by a panicking holder
    Poisoned,
    /// Execution task died before producing a result
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Poisoned => write!(f, "Store lock poisoned"),
            StoreError::Task(e) => write!(f, "Execution task failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Options for [`SourceStore::find`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub limit: Option<usize>,

    /// Fields to keep in returned records; empty keeps everything
    pub fields: Vec<String>,

    pub sort: Vec<SortKey>,
}

/// Notification delivered by a change feed
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added { key: String, record: Record },
    Removed { key: String },
}

impl ChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Added { key, .. } | ChangeEvent::Removed { key } => key,
        }
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Live subscription to a store's changes. Dropping it stops delivery.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    stopper: Option<StopFn>,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>, stopper: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            stopper: Some(Box::new(stopper)),
        }
    }

    /// Next event, or `None` once the store side is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Discard queued events, returning how many were dropped
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if let Some(stopper) = self.stopper.take() {
            stopper();
        }
        self.rx.close();
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("stopped", &self.stopper.is_none())
            .finish()
    }
}

/// Mutable record store the view is derived from
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Name used as the default view name
    fn name(&self) -> &str;

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Record>, StoreError>;

    /// Subscribe to additions and removals of records matching `filter`
    fn subscribe_changes(&self, filter: &Filter) -> Result<ChangeFeed, StoreError>;
}

/// Declarative pipeline execution engine (may be slow, may fail)
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<ResultRow>, StoreError>;
}
