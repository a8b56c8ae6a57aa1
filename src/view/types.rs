//! Core data types flowing through the reconciliation engine

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// JSON object used for records, result rows and emitted documents
pub type Document = Map<String, Value>;

/// Field under which a document carries its key (records) or grouping key (rows)
pub const ID_FIELD: &str = "_id";

/// Opaque input unit from the source store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Immutable primary key
    pub key: String,

    /// Field values (timestamps are integer milliseconds)
    pub doc: Document,
}

impl Record {
    pub fn new(key: impl Into<String>, doc: Document) -> Self {
        Self {
            key: key.into(),
            doc,
        }
    }

    /// Build a record from a JSON value; non-object values produce an empty document
    pub fn from_json(key: impl Into<String>, value: Value) -> Self {
        let doc = match value {
            Value::Object(map) => map,
            _ => Document::new(),
        };
        Self::new(key, doc)
    }

    /// Look up a (possibly dotted) field. `_id` resolves to the record key.
    pub fn get(&self, field: &str) -> Option<Value> {
        if field == ID_FIELD {
            return Some(Value::String(self.key.clone()));
        }
        crate::view::pipeline::lookup(&self.doc, field).cloned()
    }

    /// Millisecond timestamp stored in `field`, if numeric
    pub fn timestamp(&self, field: &str) -> Option<i64> {
        let value = crate::view::pipeline::lookup(&self.doc, field)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// Document view of the record with the key under `_id`
    pub fn to_document(&self) -> Document {
        let mut doc = self.doc.clone();
        doc.insert(ID_FIELD.to_string(), Value::String(self.key.clone()));
        doc
    }
}

/// Value a pipeline groups records by.
///
/// May be a composite structural value, so it is identified by its canonical
/// JSON serialization (object keys sorted) rather than used directly.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingKey(pub Value);

impl GroupingKey {
    pub fn canonical(&self) -> String {
        // serde_json's default map is ordered, so equal structures serialize identically
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// Stable public identifier minted per distinct grouping key
///
/// Tagged with the identity generation it was minted in; identifiers from an
/// earlier generation are never considered live again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId {
    generation: u32,
    seq: u64,
}

impl OutputId {
    pub(crate) fn new(generation: u32, seq: u64) -> Self {
        Self { generation, seq }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.generation, self.seq)
    }
}

impl Serialize for OutputId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One output tuple of the pipeline: grouping key plus non-key fields
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub key: Value,
    pub values: Document,
}

impl ResultRow {
    /// Split a pipeline output document into key and values
    pub fn from_document(mut doc: Document) -> Self {
        let key = doc.remove(ID_FIELD).unwrap_or(Value::Null);
        Self { key, values: doc }
    }

    pub fn grouping_key(&self) -> GroupingKey {
        GroupingKey(self.key.clone())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == ID_FIELD {
            return Some(&self.key);
        }
        self.values.get(field)
    }

    /// Full row as emitted downstream (`_id` first, then the values)
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), self.key.clone());
        for (field, value) in &self.values {
            doc.insert(field.clone(), value.clone());
        }
        doc
    }
}

/// Event produced for the downstream publish contract
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ViewEvent {
    Added { view: String, id: OutputId, row: Value },
    Changed { view: String, id: OutputId, row: Value },
    Removed { view: String, id: OutputId },
    Ready { view: String },
    Failed { view: String, error: String },
}

impl ViewEvent {
    /// Identifier the event refers to, if any
    pub fn id(&self) -> Option<OutputId> {
        match self {
            ViewEvent::Added { id, .. }
            | ViewEvent::Changed { id, .. }
            | ViewEvent::Removed { id, .. } => Some(*id),
            ViewEvent::Ready { .. } | ViewEvent::Failed { .. } => None,
        }
    }
}
