//! In-memory pipeline execution
//!
//! Runs each stage over a vector of documents. Groups keep first-seen order,
//! so output order is deterministic for a given input order.

use super::FindOptions;
use crate::view::pipeline::{
    lookup, sort_order, Accumulator, Filter, GroupStage, Pipeline, SortDirection, SortKey, Stage,
};
use crate::view::types::{Document, GroupingKey, Record, ResultRow, ID_FIELD};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Execute `pipeline` over `docs` and split the output into result rows
pub fn run_pipeline(pipeline: &Pipeline, docs: Vec<Document>) -> Vec<ResultRow> {
    let mut docs = docs;
    for stage in &pipeline.stages {
        docs = apply_stage(stage, docs);
    }
    docs.into_iter().map(ResultRow::from_document).collect()
}

pub fn apply_stage(stage: &Stage, docs: Vec<Document>) -> Vec<Document> {
    match stage {
        Stage::Match(filter) => docs.into_iter().filter(|doc| filter.matches(doc)).collect(),
        Stage::Group(group) => group_docs(group, &docs),
        Stage::Sort(keys) => sort_docs(keys, docs),
        Stage::Limit(n) => docs.into_iter().take(*n).collect(),
    }
}

/// Shared `find` semantics: filter, sort, limit, then project
pub fn select_records<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    filter: &Filter,
    options: &FindOptions,
) -> Vec<Record> {
    let mut matched: Vec<(Document, &Record)> = records
        .into_iter()
        .map(|record| (record.to_document(), record))
        .filter(|(doc, _)| filter.matches(doc))
        .collect();

    if !options.sort.is_empty() {
        matched.sort_by(|(a, _), (b, _)| compare_by_keys(&options.sort, a, b));
    }

    let limit = options.limit.unwrap_or(usize::MAX);
    matched
        .into_iter()
        .take(limit)
        .map(|(_, record)| project(record, &options.fields))
        .collect()
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    let mut doc = Document::new();
    for field in fields {
        if let Some(value) = lookup(&record.doc, field) {
            insert_path(&mut doc, field, value.clone());
        }
    }
    Record::new(record.key.clone(), doc)
}

/// Place `value` at a dotted `path`, creating intermediate objects
fn insert_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(inner) = child {
                insert_path(inner, rest, value);
            }
        }
    }
}

fn compare_by_keys(keys: &[SortKey], a: &Document, b: &Document) -> Ordering {
    for key in keys {
        let left = lookup(a, &key.field).unwrap_or(&Value::Null);
        let right = lookup(b, &key.field).unwrap_or(&Value::Null);
        let ordering = match key.direction {
            SortDirection::Asc => sort_order(left, right),
            SortDirection::Desc => sort_order(right, left),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}

fn sort_docs(keys: &[SortKey], mut docs: Vec<Document>) -> Vec<Document> {
    docs.sort_by(|a, b| compare_by_keys(keys, a, b));
    docs
}

fn group_docs(group: &GroupStage, docs: &[Document]) -> Vec<Document> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<(Value, Vec<&Document>)> = Vec::new();

    for doc in docs {
        let key = group.key.key_of(doc);
        let canonical = GroupingKey(key.clone()).canonical();
        let slot = *index.entry(canonical).or_insert_with(|| {
            buckets.push((key, Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].1.push(doc);
    }

    buckets
        .into_iter()
        .map(|(key, members)| {
            let mut out = Document::new();
            out.insert(ID_FIELD.to_string(), key);
            for (name, accumulator) in &group.outputs {
                out.insert(name.clone(), accumulate(accumulator, &members));
            }
            out
        })
        .collect()
}

fn accumulate(accumulator: &Accumulator, members: &[&Document]) -> Value {
    let field_values = |field: &str| -> Vec<&Value> {
        members
            .iter()
            .filter_map(|doc| lookup(doc, field))
            .filter(|v| !v.is_null())
            .collect()
    };

    match accumulator {
        Accumulator::Count => Value::from(members.len() as i64),
        Accumulator::Sum(field) => sum(&field_values(field)),
        Accumulator::Min(field) => field_values(field)
            .into_iter()
            .min_by(|a, b| sort_order(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        Accumulator::Max(field) => field_values(field)
            .into_iter()
            .max_by(|a, b| sort_order(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        Accumulator::Avg(field) => {
            let numbers: Vec<f64> = field_values(field).iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
    }
}

/// Integer sum while every operand is an integer, float otherwise
fn sum(values: &[&Value]) -> Value {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for value in values {
        let Value::Number(n) = value else { continue };
        int_total = match (int_total, n.as_i64()) {
            (Some(total), Some(x)) => total.checked_add(x),
            _ => None,
        };
        float_total += n.as_f64().unwrap_or(0.0);
    }
    match int_total {
        Some(total) => Value::from(total),
        None => float(float_total),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}
