//! Remote cache mirror
//!
//! The mirror answers two questions separately: "is there a result for this
//! key" and "give me the bytes of this object". Keeping them apart lets a
//! build learn about a hit without paying for downloads it may never use.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::disk::OnDiskCas;
use crate::error::{CasError, Result};
use crate::object::{CasObject, DataId};
use crate::store::ContentStore;

/// A remote key/object service
#[async_trait]
pub trait RemoteCache: Send + Sync + std::fmt::Debug {
    /// The result id cached remotely for `key`, if any
    async fn query_key(&self, key: &DataId) -> Result<Option<DataId>>;

    /// Download one object
    async fn fetch_object(&self, id: &DataId) -> Result<Option<CasObject>>;

    /// Publish `value` (and everything it references) as the result for `key`
    async fn upload(&self, key: &DataId, value: &DataId, local: &dyn ContentStore) -> Result<()>;
}

/// A mirror backed by a second on-disk store, such as a shared network mount
#[derive(Debug)]
pub struct DirectoryRemoteCache {
    store: OnDiskCas,
}

impl DirectoryRemoteCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: OnDiskCas::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &OnDiskCas {
        &self.store
    }
}

#[async_trait]
impl RemoteCache for DirectoryRemoteCache {
    async fn query_key(&self, key: &DataId) -> Result<Option<DataId>> {
        self.store.lookup_cached_object(key).await
    }

    async fn fetch_object(&self, id: &DataId) -> Result<Option<CasObject>> {
        self.store.load(id).await
    }

    async fn upload(&self, key: &DataId, value: &DataId, local: &dyn ContentStore) -> Result<()> {
        copy_object_tree(local, &self.store, value).await?;
        self.store.cache(value, key).await?;
        debug!(key = %key, value = %value, "uploaded cache entry");
        Ok(())
    }
}

/// Download `id` and everything it references into `local`, skipping objects already present
pub async fn fetch_object_tree(
    remote: &dyn RemoteCache,
    local: &dyn ContentStore,
    id: &DataId,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut queue = vec![id.clone()];
    while let Some(next) = queue.pop() {
        if !seen.insert(next.clone()) || local.contains(&next).await? {
            continue;
        }
        let object = remote
            .fetch_object(&next)
            .await?
            .ok_or_else(|| CasError::ObjectNotFound(next.clone()))?;
        queue.extend(object.refs.iter().cloned());
        local.store(object).await?;
    }
    Ok(())
}

/// Copy `id` and everything it references from one store to another
pub async fn copy_object_tree(
    from: &dyn ContentStore,
    to: &dyn ContentStore,
    id: &DataId,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut queue = vec![id.clone()];
    while let Some(next) = queue.pop() {
        if !seen.insert(next.clone()) || to.contains(&next).await? {
            continue;
        }
        let object = from.load_existing(&next).await?;
        queue.extend(object.refs.iter().cloned());
        to.store(object).await?;
    }
    Ok(())
}
