//! The content store contract

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{CasError, Result};
use crate::object::{CasObject, DataId};

/// Object store plus action cache.
///
/// Implementations must be safe for concurrent use from many tasks: every
/// operation is independently atomic, and storing an object that already
/// exists is a no-op returning the same id.
#[async_trait]
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Store an object, returning its content id
    async fn store(&self, object: CasObject) -> Result<DataId>;

    /// Load an object, or `None` if it is not present
    async fn load(&self, id: &DataId) -> Result<Option<CasObject>>;

    /// Associate a result object with a key object
    async fn cache(&self, object_id: &DataId, key_id: &DataId) -> Result<()>;

    /// Look up the result associated with a key, if any
    async fn lookup_cached_object(&self, key_id: &DataId) -> Result<Option<DataId>>;

    /// Summary of what the store holds
    async fn stats(&self) -> Result<CasStats>;

    /// Load an object that must exist
    async fn load_existing(&self, id: &DataId) -> Result<CasObject> {
        self.load(id)
            .await?
            .ok_or_else(|| CasError::ObjectNotFound(id.clone()))
    }

    async fn contains(&self, id: &DataId) -> Result<bool> {
        Ok(self.load(id).await?.is_some())
    }

    /// Whether `id` and every object reachable from it are present
    async fn contains_tree(&self, id: &DataId) -> Result<bool> {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            match self.load(&next).await? {
                Some(object) => stack.extend(object.refs),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Whether [`ContentStore::prune`] does anything
    fn supports_pruning(&self) -> bool {
        false
    }

    /// Bytes used on disk, if the store is disk-backed
    fn on_disk_size(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Limit applied by the next [`ContentStore::prune`]; `None` means unlimited
    fn set_on_disk_size_limit(&self, _limit: Option<u64>) -> Result<()> {
        Ok(())
    }

    /// Evict data until the store fits its size limit
    fn prune(&self) -> Result<()> {
        Ok(())
    }
}

/// Store statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct CasStats {
    /// Number of stored objects
    pub objects: usize,
    /// Number of key to result associations
    pub cache_entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CasStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        format_size(self.total_size)
    }
}

/// Render a byte count with a binary unit
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
