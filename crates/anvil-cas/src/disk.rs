//! On-disk content store
//!
//! Layout under the store root:
//! - `objects/<ab>/<id>`: encoded [`CasObject`]s
//! - `actions/<ab>/<key-id>`: the id of the result cached for that key
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! concurrent reader never observes a partially written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::object::{CasObject, DataId};
use crate::store::{CasStats, ContentStore};

const OBJECTS_DIR: &str = "objects";
const ACTIONS_DIR: &str = "actions";

/// Stored as the size limit when there is none
const UNLIMITED: u64 = u64::MAX;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Content store persisted in a directory
#[derive(Debug)]
pub struct OnDiskCas {
    root: PathBuf,
    /// [`UNLIMITED`] when unset
    size_limit: AtomicU64,
}

impl OnDiskCas {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(OBJECTS_DIR))?;
        std::fs::create_dir_all(root.join(ACTIONS_DIR))?;
        debug!(root = %root.display(), "opened on-disk CAS");
        Ok(Self {
            root,
            size_limit: AtomicU64::new(UNLIMITED),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove every object and cache entry
    pub fn clean(&self) -> Result<()> {
        info!(root = %self.root.display(), "cleaning CAS");
        for dir in [OBJECTS_DIR, ACTIONS_DIR] {
            let path = self.root.join(dir);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::fs::create_dir_all(&path)?;
        }
        Ok(())
    }

    fn object_path(&self, id: &DataId) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(id.prefix())
            .join(id.as_str())
    }

    fn action_path(&self, key: &DataId) -> PathBuf {
        self.root
            .join(ACTIONS_DIR)
            .join(key.prefix())
            .join(key.as_str())
    }

    async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Err(std::io::Error::new(ErrorKind::InvalidInput, "path has no parent").into());
        };
        tokio::fs::create_dir_all(parent).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(
            ".{}.tmp.{}.{}",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp, contents).await?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Mark `path` as recently used so pruning evicts it last
    fn touch(path: &Path) {
        let touched = std::fs::File::options()
            .append(true)
            .open(path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            debug!(path = %path.display(), error = %e, "could not update modification time");
        }
    }

    /// Every file in the store with its size and modification time
    fn entries(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((e.into_path(), meta.len(), modified))
            })
            .collect()
    }
}

#[async_trait]
impl ContentStore for OnDiskCas {
    async fn store(&self, object: CasObject) -> Result<DataId> {
        let id = object.id();
        let path = self.object_path(&id);
        if tokio::fs::try_exists(&path).await? {
            Self::touch(&path);
            return Ok(id);
        }
        Self::write_atomically(&path, &object.to_bytes()).await?;
        Ok(id)
    }

    async fn load(&self, id: &DataId) -> Result<Option<CasObject>> {
        match tokio::fs::read(self.object_path(id)).await {
            Ok(bytes) => Ok(Some(CasObject::from_bytes(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn cache(&self, object_id: &DataId, key_id: &DataId) -> Result<()> {
        Self::write_atomically(&self.action_path(key_id), object_id.as_str().as_bytes()).await
    }

    async fn lookup_cached_object(&self, key_id: &DataId) -> Result<Option<DataId>> {
        let action_path = self.action_path(key_id);
        let contents = match tokio::fs::read_to_string(&action_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(id) = DataId::from_hex(contents.trim()) else {
            warn!(key = %key_id, "ignoring corrupt action cache entry");
            return Ok(None);
        };
        // The result may have been evicted independently of the entry
        let object_path = self.object_path(&id);
        if !tokio::fs::try_exists(&object_path).await? {
            return Ok(None);
        }
        Self::touch(&action_path);
        Self::touch(&object_path);
        Ok(Some(id))
    }

    async fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats::default();
        for (path, size, _) in self.entries() {
            stats.total_size += size;
            if path.starts_with(self.root.join(OBJECTS_DIR)) {
                stats.objects += 1;
            } else if path.starts_with(self.root.join(ACTIONS_DIR)) {
                stats.cache_entries += 1;
            }
        }
        Ok(stats)
    }

    fn supports_pruning(&self) -> bool {
        true
    }

    fn on_disk_size(&self) -> Result<Option<u64>> {
        Ok(Some(self.entries().iter().map(|(_, size, _)| size).sum()))
    }

    fn set_on_disk_size_limit(&self, limit: Option<u64>) -> Result<()> {
        self.size_limit.store(limit.unwrap_or(UNLIMITED), Ordering::Relaxed);
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        let limit = self.size_limit.load(Ordering::Relaxed);
        if limit == UNLIMITED {
            debug!(root = %self.root.display(), "no size limit, skipping prune");
            return Ok(());
        }

        let mut entries = self.entries();
        let mut total: u64 = entries.iter().map(|(_, size, _)| size).sum();
        if total <= limit {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, modified)| *modified);
        let mut removed = 0usize;
        for (path, size, _) in entries {
            if total <= limit {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    total = total.saturating_sub(size);
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            root = %self.root.display(),
            removed,
            remaining_bytes = total,
            limit,
            "CAS prune complete"
        );
        Ok(())
    }
}
