//! Document store data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Field map of a document.
pub type Fields = Map<String, Value>;

/// A stored document with server-assigned timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Last path segment.
    pub id: String,
    /// Full path, e.g. `devices/feeder-01/histories/abc`.
    pub path: String,
    pub data: Fields,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Parent collection path of this document.
    pub fn collection(&self) -> &str {
        parent_collection(&self.path).unwrap_or("")
    }
}

/// Returns the collection part of a document path (`a/b/c/d` -> `a/b/c`).
pub fn parent_collection(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Document paths have an even number of non-empty segments.
pub fn is_document_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    segments.len() % 2 == 0 && segments.iter().all(|s| !s.is_empty())
}

/// Collection paths have an odd number of non-empty segments.
pub fn is_collection_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    segments.len() % 2 == 1 && segments.iter().all(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderField {
    /// Server-assigned creation time.
    CreateTime,
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: OrderField,
    pub direction: Direction,
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

/// A query over the direct children of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: OrderField, direction: Direction) -> Self {
        self.order_by = Some(OrderBy { field, direction });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.collection() == self.collection
            && self
                .filters
                .iter()
                .all(|f| document.data.get(&f.field) == Some(&f.value))
    }

    /// Sorts and truncates an already filtered result set.
    pub fn arrange(&self, documents: &mut Vec<Document>) {
        if let Some(order) = &self.order_by {
            documents.sort_by(|a, b| {
                let ordering = match &order.field {
                    OrderField::CreateTime => a.create_time.cmp(&b.create_time),
                    OrderField::Field(name) => compare_values(a.get(name), b.get(name)),
                };
                let ordering = ordering.then_with(|| a.path.cmp(&b.path));
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        } else {
            documents.sort_by(|a, b| a.path.cmp(&b.path));
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
    }
}

/// What a listener is attached to.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    Document(String),
    Query(Query),
}

impl WatchTarget {
    /// Whether a write to `path` can change this target's result set.
    pub fn is_affected_by(&self, path: &str) -> bool {
        match self {
            WatchTarget::Document(watched) => watched == path,
            WatchTarget::Query(query) => parent_collection(path) == Some(query.collection.as_str()),
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchTarget::Document(path) => write!(f, "doc:{}", path),
            WatchTarget::Query(query) => write!(f, "query:{}", query.collection),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a change batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// Null < bool < number < string; anything else compares equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
