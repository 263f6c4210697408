//! In-memory store, used for discarded caches and in tests

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::object::{CasObject, DataId};
use crate::store::{CasStats, ContentStore};

#[derive(Debug, Default)]
pub struct InMemoryCas {
    objects: RwLock<HashMap<DataId, CasObject>>,
    actions: RwLock<HashMap<DataId, DataId>>,
}

impl InMemoryCas {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for InMemoryCas {
    async fn store(&self, object: CasObject) -> Result<DataId> {
        let id = object.id();
        self.objects
            .write()
            .await
            .entry(id.clone())
            .or_insert(object);
        Ok(id)
    }

    async fn load(&self, id: &DataId) -> Result<Option<CasObject>> {
        Ok(self.objects.read().await.get(id).cloned())
    }

    async fn cache(&self, object_id: &DataId, key_id: &DataId) -> Result<()> {
        self.actions
            .write()
            .await
            .insert(key_id.clone(), object_id.clone());
        Ok(())
    }

    async fn lookup_cached_object(&self, key_id: &DataId) -> Result<Option<DataId>> {
        Ok(self.actions.read().await.get(key_id).cloned())
    }

    async fn stats(&self) -> Result<CasStats> {
        let objects = self.objects.read().await;
        Ok(CasStats {
            objects: objects.len(),
            cache_entries: self.actions.read().await.len(),
            total_size: objects.values().map(|o| o.data.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let cas = InMemoryCas::new();
        let a = cas.store(CasObject::leaf("same")).await.unwrap();
        let b = cas.store(CasObject::leaf("same")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cas.stats().await.unwrap().objects, 1);
        assert!(!cas.supports_pruning());
    }

    #[tokio::test]
    async fn test_action_cache() {
        let cas = InMemoryCas::new();
        let key = cas.store(CasObject::leaf("key")).await.unwrap();
        let value = cas.store(CasObject::leaf("value")).await.unwrap();
        assert_eq!(cas.lookup_cached_object(&key).await.unwrap(), None);
        cas.cache(&value, &key).await.unwrap();
        assert_eq!(cas.lookup_cached_object(&key).await.unwrap(), Some(value));
    }
}
