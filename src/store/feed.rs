//! Change-feed fan-out shared by the store implementations
//!
//! Each subscriber tracks the keys it currently matches so that a removal is
//! only delivered to feeds that saw the record, and a replacement is seen as
//! remove-then-add (or just a removal when the new version stops matching).

use super::{ChangeEvent, ChangeFeed, StoreError};
use crate::view::pipeline::Filter;
use crate::view::types::Record;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

struct Subscriber {
    id: u64,
    filter: Filter,
    keys: HashSet<String>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Clone, Default)]
pub struct FeedRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feed for `filter`. `existing` seeds the matched-key set
    /// without emitting events for records already in the store.
    pub fn subscribe<'a>(
        &self,
        filter: &Filter,
        existing: impl IntoIterator<Item = &'a Record>,
    ) -> Result<ChangeFeed, StoreError> {
        let keys = existing
            .into_iter()
            .filter(|record| filter.matches(&record.to_document()))
            .map(|record| record.key.clone())
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            filter: filter.clone(),
            keys,
            tx,
        });
        drop(inner);

        let registry: Weak<Mutex<RegistryInner>> = Arc::downgrade(&self.inner);
        Ok(ChangeFeed::new(rx, move || {
            if let Some(inner) = registry.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.subscribers.retain(|s| s.id != id);
                }
            }
        }))
    }

    /// Fan out an inserted or replaced record
    pub fn publish_upsert(&self, record: &Record) {
        let doc = record.to_document();
        self.dispatch(|subscriber| {
            let mut events = Vec::new();
            let matched_before = subscriber.keys.contains(&record.key);
            let matches_now = subscriber.filter.matches(&doc);

            if matched_before {
                events.push(ChangeEvent::Removed {
                    key: record.key.clone(),
                });
            }
            if matches_now {
                subscriber.keys.insert(record.key.clone());
                events.push(ChangeEvent::Added {
                    key: record.key.clone(),
                    record: record.clone(),
                });
            } else {
                subscriber.keys.remove(&record.key);
            }
            events
        });
    }

    /// Fan out a removed key to the feeds that matched it
    pub fn publish_removed(&self, key: &str) {
        self.dispatch(|subscriber| {
            if subscriber.keys.remove(key) {
                vec![ChangeEvent::Removed {
                    key: key.to_string(),
                }]
            } else {
                Vec::new()
            }
        });
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.subscribers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch(&self, mut events_for: impl FnMut(&mut Subscriber) -> Vec<ChangeEvent>) {
        let Ok(mut inner) = self.inner.lock() else {
            log::error!("❌ Change feed registry poisoned, dropping notification");
            return;
        };
        inner.subscribers.retain_mut(|subscriber| {
            for event in events_for(subscriber) {
                if subscriber.tx.send(event).is_err() {
                    log::debug!("Change feed {} closed, unsubscribing", subscriber.id);
                    return false;
                }
            }
            true
        });
    }
}
