//! Typed pipeline definitions
//!
//! A pipeline is a declarative stage sequence (`Match`, `Group`, `Sort`,
//! `Limit`) handed to a [`PipelineExecutor`](crate::store::PipelineExecutor).
//! Instead of introspecting arbitrary stage objects at runtime, the grouping
//! shape is read from [`Pipeline::descriptor`].

use super::types::Document;
use serde_json::Value;
use std::cmp::Ordering;

/// Resolve a dotted field path (`a.b.c`) inside a document
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Partial order used by predicates: numbers numerically, strings
/// lexically, booleans by value. Mixed types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: null < bool < number < string < array < object
pub fn sort_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = lookup(doc, &self.field).unwrap_or(&Value::Null);
        let ordering = compare_values(actual, &self.value);
        match self.op {
            CompareOp::Eq => ordering == Some(Ordering::Equal) || *actual == self.value,
            CompareOp::Ne => !(ordering == Some(Ordering::Equal) || *actual == self.value),
            CompareOp::Gt => ordering == Some(Ordering::Greater),
            CompareOp::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            CompareOp::Lt => ordering == Some(Ordering::Less),
            CompareOp::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Conjunction of conditions; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn with(mut self, field: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Eq, value)
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Ne, value)
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Gt, value)
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Gte, value)
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Lt, value)
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, CompareOp::Lte, value)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| c.matches(doc))
    }

    /// Replace any lower bound on `field` with a strict `field > bound`
    pub fn set_lower_bound(&mut self, field: &str, bound: Value) {
        self.conditions
            .retain(|c| !(c.field == field && matches!(c.op, CompareOp::Gt | CompareOp::Gte)));
        self.conditions.push(Condition {
            field: field.to_string(),
            op: CompareOp::Gt,
            value: bound,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupKeySpec {
    /// Group by one field
    Field(String),

    /// Group by several fields; the key is an object of their values
    Composite(Vec<String>),

    /// Single group for every input (`_id: null`)
    Constant,
}

impl GroupKeySpec {
    pub fn key_of(&self, doc: &Document) -> Value {
        match self {
            GroupKeySpec::Field(field) => lookup(doc, field).cloned().unwrap_or(Value::Null),
            GroupKeySpec::Composite(fields) => Value::Object(
                fields
                    .iter()
                    .map(|f| (f.clone(), lookup(doc, f).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
            GroupKeySpec::Constant => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Sum(String),
    Min(String),
    Max(String),
    Avg(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStage {
    pub key: GroupKeySpec,
    pub outputs: Vec<(String, Accumulator)>,
}

impl GroupStage {
    pub fn by(key: GroupKeySpec) -> Self {
        Self {
            key,
            outputs: Vec::new(),
        }
    }

    pub fn output(mut self, name: &str, accumulator: Accumulator) -> Self {
        self.outputs.push((name.to_string(), accumulator));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Group(GroupStage),
    Sort(Vec<SortKey>),
    Limit(usize),
}

/// Grouping shape of a pipeline: key plus non-key output fields
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDescriptor {
    pub group_key: GroupKeySpec,
    pub output_fields: Vec<String>,
}

impl PipelineDescriptor {
    /// The only non-key output field, when there is exactly one
    pub fn single_value_field(&self) -> Option<&str> {
        match self.output_fields.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    pub fn group(mut self, group: GroupStage) -> Self {
        self.stages.push(Stage::Group(group));
        self
    }

    pub fn sort(mut self, keys: Vec<SortKey>) -> Self {
        self.stages.push(Stage::Sort(keys));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.stages.push(Stage::Limit(n));
        self
    }

    /// Shape of the first grouping stage, if any
    pub fn descriptor(&self) -> Option<PipelineDescriptor> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Group(group) => Some(PipelineDescriptor {
                group_key: group.key.clone(),
                output_fields: group.outputs.iter().map(|(name, _)| name.clone()).collect(),
            }),
            _ => None,
        })
    }

    /// Index of the match stage that filters raw records (the first `Match`
    /// before any `Group`); inserts an empty one at the front if none exists.
    pub fn ensure_record_match(&mut self) -> usize {
        for (index, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Match(_) => return index,
                Stage::Group(_) => break,
                _ => {}
            }
        }
        self.stages.insert(0, Stage::Match(Filter::all()));
        0
    }

    /// The raw-record match filter, if present
    pub fn record_match(&self) -> Option<&Filter> {
        for stage in &self.stages {
            match stage {
                Stage::Match(filter) => return Some(filter),
                Stage::Group(_) => return None,
                _ => {}
            }
        }
        None
    }

    pub fn record_match_mut(&mut self) -> &mut Filter {
        let index = self.ensure_record_match();
        match &mut self.stages[index] {
            Stage::Match(filter) => filter,
            // ensure_record_match always yields a Match stage index
            _ => unreachable!("record match index must point at a match stage"),
        }
    }

    /// Leading `Match` stages merged into one filter (for store pushdown)
    pub fn leading_filter(&self) -> Filter {
        let mut merged = Filter::all();
        for stage in &self.stages {
            match stage {
                Stage::Match(filter) => merged.conditions.extend(filter.conditions.iter().cloned()),
                _ => break,
            }
        }
        merged
    }
}
