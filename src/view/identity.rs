//! Identity manager: grouping key -> stable output identifier
//!
//! Identifiers are minted lazily on first sight of a grouping key and stay
//! stable until released. Released keys get a fresh identifier next time;
//! identifiers are never reused within the process.
//!
//! A `reset()` advances the generation instead of relying on callers to clear
//! every map they hold: anything tagged with an older generation is dead.

use super::types::{GroupingKey, OutputId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide sequence so identifiers stay unique across managers and threads
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub struct IdentityManager {
    generation: u32,

    /// Canonical grouping key -> identifier
    by_key: HashMap<String, OutputId>,

    /// Identifier -> canonical grouping key (for release)
    by_id: HashMap<OutputId, String>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for `key`, minting one on first occurrence
    pub fn get_id(&mut self, key: &GroupingKey) -> OutputId {
        let canonical = key.canonical();
        if let Some(id) = self.by_key.get(&canonical) {
            return *id;
        }

        let id = OutputId::new(self.generation, NEXT_SEQ.fetch_add(1, Ordering::Relaxed));
        self.by_id.insert(id, canonical.clone());
        self.by_key.insert(canonical, id);
        id
    }

    /// Drop both mappings for `id`. Stale or unknown identifiers are ignored.
    pub fn release_id(&mut self, id: &OutputId) {
        if let Some(canonical) = self.by_id.remove(id) {
            self.by_key.remove(&canonical);
        }
    }

    /// Forget every mapping and start a new generation
    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True if `id` was minted in the current generation and not released
    pub fn is_live(&self, id: &OutputId) -> bool {
        id.generation() == self.generation && self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
