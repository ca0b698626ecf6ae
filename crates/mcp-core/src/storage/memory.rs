//! In-process storage backend.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{StorageBackend, StorageQuery, TransactionManager, merge, with_id};
use crate::error::{Error, Result};

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// Tables of records held in memory, ordered by id.
///
/// Transactions snapshot every table on `begin` and restore the snapshot on
/// `rollback`. Writes from other callers made during the transaction are
/// restored away too.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    snapshot: Mutex<Option<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table.
    pub async fn count(&self, table: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(table).map_or(0, BTreeMap::len)
    }

    pub async fn table_names(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, table: &str, data: Value) -> Result<Value> {
        let (id, record) = with_id(data)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(Error::conflict(table, id));
        }
        let record = Value::Object(record);
        rows.insert(id, record.clone());
        Ok(record)
    }

    async fn read(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        let mut tables = self.tables.write().await;
        let record = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| Error::not_found(table, id))?;

        let Value::Object(fields) = record else {
            return Err(Error::storage(format!("Corrupt record {}:{}", table, id)));
        };
        merge(fields, data)?;
        Ok(record.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let mut tables = self.tables.write().await;
        Ok(tables.get_mut(table).and_then(|rows| rows.remove(id)))
    }

    async fn query(&self, table: &str, query: &StorageQuery) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| query.apply(rows.values()))
            .unwrap_or_default())
    }
}

#[async_trait]
impl TransactionManager for MemoryBackend {
    async fn begin(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return Err(Error::execution("A transaction is already active"));
        }
        *snapshot = Some(self.tables.read().await.clone());
        debug!("Memory transaction started");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.take().is_none() {
            return Err(Error::execution("No active transaction to commit"));
        }
        debug!("Memory transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let restored = snapshot
            .take()
            .ok_or_else(|| Error::execution("No active transaction to roll back"))?;
        *self.tables.write().await = restored;
        debug!("Memory transaction rolled back");
        Ok(())
    }

    async fn in_transaction(&self) -> bool {
        self.snapshot.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud() {
        let store = MemoryBackend::new();
        let created = store
            .create("lists", json!({"id": "l1", "title": "Groceries"}))
            .await
            .unwrap();
        assert_eq!(created["title"], "Groceries");

        let dup = store.create("lists", json!({"id": "l1"})).await;
        assert!(matches!(dup, Err(Error::Conflict { .. })));

        let updated = store
            .update("lists", "l1", json!({"title": "Shopping", "archived": true}))
            .await
            .unwrap();
        assert_eq!(updated, json!({"id": "l1", "title": "Shopping", "archived": true}));

        let removed = store.delete("lists", "l1").await.unwrap().unwrap();
        assert_eq!(removed["title"], "Shopping");
        assert!(store.read("lists", "l1").await.unwrap().is_none());
        assert!(store.delete("lists", "l1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryBackend::new();
        let err = store
            .update("items", "nope", json!({"done": true}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_generated_ids_and_query() {
        let store = MemoryBackend::new();
        let a = store.create("items", json!({"listId": "l1"})).await.unwrap();
        store.create("items", json!({"listId": "l2"})).await.unwrap();

        let found = store
            .query("items", &StorageQuery::new().filter("listId", "l1"))
            .await
            .unwrap();
        assert_eq!(found, vec![a]);
        assert_eq!(store.count("items").await, 2);
        assert!(store.query("ghost", &StorageQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_rollback_restores() {
        let store = MemoryBackend::new();
        store.create("lists", json!({"id": "keep"})).await.unwrap();

        store.begin().await.unwrap();
        assert!(store.begin().await.is_err());
        store.create("lists", json!({"id": "temp"})).await.unwrap();
        store.delete("lists", "keep").await.unwrap();
        store.rollback().await.unwrap();

        assert!(store.read("lists", "keep").await.unwrap().is_some());
        assert!(store.read("lists", "temp").await.unwrap().is_none());
        assert!(!store.in_transaction().await);
    }

    #[tokio::test]
    async fn test_transaction_commit_keeps() {
        let store = MemoryBackend::new();
        store.begin().await.unwrap();
        store.create("lists", json!({"id": "l1"})).await.unwrap();
        store.commit().await.unwrap();

        assert!(store.read("lists", "l1").await.unwrap().is_some());
        assert!(store.commit().await.is_err());
        assert!(store.rollback().await.is_err());
    }
}
