//! Storage backends.
//!
//! Command handlers never see a concrete store. They go through a [`Repository`]
//! backed by the sync engine, which in turn talks to a [`StorageBackend`] chosen
//! when the engine is built.
//!
//! Records are JSON objects keyed by a string `"id"` field.

mod memory;
mod repository;
#[cfg(feature = "db")]
mod sqlite;
mod transaction;

pub use memory::MemoryBackend;
pub use repository::Repository;
#[cfg(feature = "db")]
pub use sqlite::SqliteBackend;
pub use transaction::{Transactional, transactional};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Field-equality query with ordering and pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuery {
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl StorageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a record satisfies every filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
    }

    /// Filter, order and paginate records in memory.
    pub fn apply<'a, I>(&self, records: I) -> Vec<Value>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut matched: Vec<&Value> = records.into_iter().filter(|r| self.matches(r)).collect();

        if let Some(field) = &self.order_by {
            matched.sort_by(|a, b| {
                compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
            });
        }
        if self.descending {
            matched.reverse();
        }

        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// The record id, if the value is an object carrying one.
pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Ensure `data` is an object with a string id, generating one if missing.
pub(crate) fn with_id(data: Value) -> Result<(String, Map<String, Value>)> {
    let Value::Object(mut map) = data else {
        return Err(Error::validation("Record data must be a JSON object"));
    };

    let id = match map.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Null) | None => {
            let id = Uuid::new_v4().to_string();
            map.insert("id".into(), Value::String(id.clone()));
            id
        }
        Some(other) => {
            return Err(Error::validation(format!(
                "Record id must be a non-empty string, got {}",
                other
            )));
        }
    };
    Ok((id, map))
}

/// Shallow-merge `patch` into `record`. The id is never overwritten.
pub(crate) fn merge(record: &mut Map<String, Value>, patch: Value) -> Result<()> {
    let Value::Object(patch) = patch else {
        return Err(Error::validation("Update data must be a JSON object"));
    };
    for (key, value) in patch {
        if key != "id" {
            record.insert(key, value);
        }
    }
    Ok(())
}

/// A table-oriented record store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Insert a record. An id is generated when `data` has none.
    async fn create(&self, table: &str, data: Value) -> Result<Value>;

    async fn read(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Shallow-merge `data` into an existing record and return the result.
    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value>;

    /// Remove a record, returning it if it existed.
    async fn delete(&self, table: &str, id: &str) -> Result<Option<Value>>;

    async fn query(&self, table: &str, query: &StorageQuery) -> Result<Vec<Value>>;
}

/// Begin/commit/rollback around a unit of work.
///
/// One transaction at a time per backend; `begin` while one is open fails.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    async fn in_transaction(&self) -> bool;
}
