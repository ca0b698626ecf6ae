//! Typed table access composed over the sync engine.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

use super::StorageQuery;
use crate::error::Result;
use crate::sync::StateSyncEngine;

/// One table, viewed as records of `T`.
///
/// Holds a handle to the sync engine rather than a backend, so every call is
/// queued and retried like any other storage operation.
pub struct Repository<T> {
    table: String,
    sync: Arc<StateSyncEngine>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            sync: self.sync.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(table: impl Into<String>, sync: Arc<StateSyncEngine>) -> Self {
        Self {
            table: table.into(),
            sync,
            _record: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn create(&self, record: &T) -> Result<T> {
        let created = self
            .sync
            .create(&self.table, serde_json::to_value(record)?)
            .await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn find(&self, id: &str) -> Result<Option<T>> {
        match self.sync.read(&self.table, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Shallow-merge `patch` into the record.
    pub async fn update(&self, id: &str, patch: Value) -> Result<T> {
        let updated = self.sync.update(&self.table, id, patch).await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn delete(&self, id: &str) -> Result<Option<T>> {
        match self.sync.delete(&self.table, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn find_where(&self, query: StorageQuery) -> Result<Vec<T>> {
        self.sync
            .query(&self.table, query)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::sync::SyncConfig;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TodoItem {
        id: String,
        list_id: String,
        title: String,
        #[serde(default)]
        done: bool,
    }

    fn repo() -> Repository<TodoItem> {
        let sync = Arc::new(StateSyncEngine::new(
            Arc::new(MemoryBackend::new()),
            SyncConfig::default(),
        ));
        Repository::new("items", sync)
    }

    fn item(id: &str, list: &str) -> TodoItem {
        TodoItem {
            id: id.into(),
            list_id: list.into(),
            title: format!("item {}", id),
            done: false,
        }
    }

    #[tokio::test]
    async fn test_typed_crud() {
        let items = repo();
        items.create(&item("i1", "l1")).await.unwrap();

        let updated = items.update("i1", json!({"done": true})).await.unwrap();
        assert!(updated.done);
        assert_eq!(items.find("i1").await.unwrap(), Some(updated.clone()));

        assert_eq!(items.delete("i1").await.unwrap(), Some(updated));
        assert_eq!(items.find("i1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_where() {
        let items = repo();
        items.create(&item("a", "l1")).await.unwrap();
        items.create(&item("b", "l2")).await.unwrap();
        items.create(&item("c", "l1")).await.unwrap();

        let found = items
            .find_where(StorageQuery::new().filter("listId", "l1"))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_an_error() {
        let items = repo();
        items.create(&item("i1", "l1")).await.unwrap();
        let err = items.update("i1", json!({"title": 42})).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Serialization(_)));
    }
}
