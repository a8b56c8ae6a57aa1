//! In-process record store
//!
//! Keeps records in a `BTreeMap` keyed by primary key. Mutations are fanned
//! out to change feeds while the record lock is still held, so a subscriber
//! registered between two writes never misses or double-counts one.

use super::executor::{run_pipeline, select_records};
use super::feed::FeedRegistry;
use super::{ChangeFeed, FindOptions, PipelineExecutor, SourceStore, StoreError};
use crate::view::pipeline::{Filter, Pipeline};
use crate::view::types::{Record, ResultRow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub struct MemoryStore {
    name: String,
    records: Mutex<BTreeMap<String, Record>>,
    feeds: FeedRegistry,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(BTreeMap::new()),
            feeds: FeedRegistry::new(),
        }
    }

    /// Insert or replace a record
    pub fn insert(&self, record: Record) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        self.feeds.publish_upsert(&record);
        records.insert(record.key.clone(), record);
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let existed = records.remove(key).is_some();
        if existed {
            self.feeds.publish_removed(key);
        }
        Ok(existed)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open change feeds
    pub fn subscriber_count(&self) -> usize {
        self.feeds.len()
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Record>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(select_records(records.values(), filter, options))
    }

    fn subscribe_changes(&self, filter: &Filter) -> Result<ChangeFeed, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        self.feeds.subscribe(filter, records.values())
    }
}

#[async_trait]
impl PipelineExecutor for MemoryStore {
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<ResultRow>, StoreError> {
        let docs = {
            let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
            records.values().map(Record::to_document).collect()
        };
        Ok(run_pipeline(pipeline, docs))
    }
}
