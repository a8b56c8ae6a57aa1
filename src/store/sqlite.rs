//! SQLite-backed record store
//!
//! Records are stored as JSON documents in a single table:
//!
//! ```sql
//! CREATE TABLE records (key TEXT PRIMARY KEY, doc TEXT NOT NULL)
//! ```
//!
//! Leading match conditions with scalar operands are pushed down as
//! `json_extract(doc, '$.field') <op> ?`. SQLite's comparison rules are looser
//! than the pipeline's, so pushdown only narrows the scan and every row is
//! re-checked in Rust before the in-memory executor runs the full pipeline.

use super::executor::{run_pipeline, select_records};
use super::feed::FeedRegistry;
use super::{ChangeFeed, FindOptions, PipelineExecutor, SourceStore, StoreError};
use crate::view::pipeline::{CompareOp, Condition, Filter, Pipeline};
use crate::view::types::{Document, Record, ResultRow, ID_FIELD};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct SqliteStore {
    name: String,
    conn: Arc<Mutex<Connection>>,
    feeds: FeedRegistry,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: impl AsRef<Path>, name: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            )",
            [],
        )?;

        log::info!("✅ SQLite record store '{}' initialized with WAL mode", name);

        Ok(Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            feeds: FeedRegistry::new(),
        })
    }

    /// Insert or replace a record
    pub fn insert(&self, record: Record) -> Result<(), StoreError> {
        let doc = serde_json::to_string(&record.doc)?;
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO records (key, doc) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET doc = excluded.doc",
            params![record.key, doc],
        )?;
        self.feeds.publish_upsert(&record);
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let changed = conn.execute("DELETE FROM records WHERE key = ?", params![key])?;
        if changed > 0 {
            self.feeds.publish_removed(key);
        }
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Records passing `filter`, using pushdown where possible
    fn load(conn: &Connection, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let mut sql = String::from("SELECT key, doc FROM records");
        let mut bindings: Vec<SqlValue> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();

        for condition in &filter.conditions {
            if let Some(clause) = pushdown(condition, &mut bindings) {
                clauses.push(clause);
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY key");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, doc) = row?;
            let doc: Document = serde_json::from_str(&doc)?;
            let record = Record::new(key, doc);
            if filter.matches(&record.to_document()) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// SQL clause for a condition, or `None` when it has to be evaluated in Rust
fn pushdown(condition: &Condition, bindings: &mut Vec<SqlValue>) -> Option<String> {
    // NULL never compares true in SQL, but missing fields match `= null` and `<> x`
    if condition.op == CompareOp::Ne {
        return None;
    }
    let operand = match &condition.value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64()?),
        },
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };

    let column = if condition.field == ID_FIELD {
        "key".to_string()
    } else {
        let plain = condition
            .field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !plain {
            return None;
        }
        bindings.push(SqlValue::Text(format!("$.{}", condition.field)));
        "json_extract(doc, ?)".to_string()
    };

    bindings.push(operand);
    Some(format!("{} {} ?", column, condition.op.as_sql()))
}

#[async_trait]
impl SourceStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Record>, StoreError> {
        let records = {
            let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            Self::load(&conn, filter)?
        };
        Ok(select_records(&records, &Filter::all(), options))
    }

    fn subscribe_changes(&self, filter: &Filter) -> Result<ChangeFeed, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let existing = Self::load(&conn, filter)?;
        self.feeds.subscribe(filter, &existing)
    }
}

#[async_trait]
impl PipelineExecutor for SqliteStore {
    async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<ResultRow>, StoreError> {
        let docs: Vec<Document> = {
            let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            Self::load(&conn, &pipeline.leading_filter())?
                .iter()
                .map(Record::to_document)
                .collect()
        };
        Ok(run_pipeline(pipeline, docs))
    }
}
