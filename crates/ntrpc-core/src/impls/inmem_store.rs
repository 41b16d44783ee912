//! MemoryDataStore - プロセス内の key/value ストア
//!
//! 再起動で消えるので本番の Queue には使えない。テストとデモ用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ports::{DataStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct MemoryDataStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryDataStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let store = MemoryDataStore::new();
        let other = store.clone();
        store.set("b", "1").await.unwrap();
        other.set("a", "2").await.unwrap();
        assert_eq!(store.keys().await, vec!["a".to_owned(), "b".to_owned()]);
    }
}
