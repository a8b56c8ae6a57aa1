//! Last-published state of a view
//!
//! Maps each live output identifier to the value it was last compared by.
//! Entries are tagged with the identity generation they were written in; once
//! the generation advances they are invisible and get purged lazily.

use super::types::OutputId;
use serde_json::Value;
use std::collections::BTreeMap;

/// Comparison value stored for a published row
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedValue {
    /// Row is published; no scalar comparison configured
    Present,

    /// Single-value mode: last emitted scalar
    Scalar(Value),
}

#[derive(Debug, Clone)]
struct PublishedEntry {
    generation: u32,
    value: PublishedValue,
}

#[derive(Debug, Default)]
pub struct ViewSnapshot {
    generation: u32,
    entries: BTreeMap<OutputId, PublishedEntry>,
}

impl ViewSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &OutputId) -> Option<&PublishedValue> {
        self.entries
            .get(id)
            .filter(|entry| entry.generation == self.generation)
            .map(|entry| &entry.value)
    }

    pub fn contains(&self, id: &OutputId) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, id: OutputId, value: PublishedValue) {
        self.entries.insert(
            id,
            PublishedEntry {
                generation: self.generation,
                value,
            },
        );
    }

    pub fn remove(&mut self, id: &OutputId) -> Option<PublishedValue> {
        let entry = self.entries.remove(id)?;
        (entry.generation == self.generation).then_some(entry.value)
    }

    /// Live identifiers, in mint order
    pub fn ids(&self) -> Vec<OutputId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.generation == self.generation)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Switch to `generation`; older entries stop being visible
    pub fn advance(&mut self, generation: u32) {
        self.generation = generation;
    }

    /// Drop entries left behind by earlier generations
    pub fn purge_stale(&mut self) {
        let generation = self.generation;
        self.entries.retain(|_, entry| entry.generation == generation);
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.generation == self.generation)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_get_remove() {
        let mut snapshot = ViewSnapshot::new();
        let id = OutputId::new(0, 1);

        snapshot.insert(id, PublishedValue::Scalar(json!(2)));
        assert_eq!(snapshot.get(&id), Some(&PublishedValue::Scalar(json!(2))));
        assert_eq!(snapshot.len(), 1);

        assert_eq!(snapshot.remove(&id), Some(PublishedValue::Scalar(json!(2))));
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_advance_hides_old_generation() {
        let mut snapshot = ViewSnapshot::new();
        let old = OutputId::new(0, 10);
        snapshot.insert(old, PublishedValue::Present);

        snapshot.advance(1);
        assert!(!snapshot.contains(&old));
        assert!(snapshot.ids().is_empty());
        assert_eq!(snapshot.remove(&old), None);

        let new = OutputId::new(1, 11);
        snapshot.insert(new, PublishedValue::Present);
        snapshot.purge_stale();
        assert_eq!(snapshot.ids(), vec![new]);
    }
}
