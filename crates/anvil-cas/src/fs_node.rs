//! File system trees in the store
//!
//! A file becomes a node object referencing one blob with its contents; a
//! directory becomes a node listing its entry names in sorted order and
//! referencing one node per entry; a symlink records its target. Identical
//! trees therefore import to identical ids regardless of where they live.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anvil_core::serialization::{self, Deserializer, Serializable, Serializer};
use anvil_core::SerializationError;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CasError, Result};
use crate::object::{CasObject, DataId};
use crate::store::ContentStore;

/// A decoded file system node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasFsNode {
    File { executable: bool, contents: DataId },
    Directory { entries: Vec<(String, DataId)> },
    Symlink { target: PathBuf },
}

enum NodeHeader {
    File { executable: bool },
    Directory { names: Vec<String> },
    Symlink { target: PathBuf },
}

impl Serializable for NodeHeader {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| match self {
            NodeHeader::File { executable } => {
                s.serialize(&0u8);
                s.serialize(executable);
            }
            NodeHeader::Directory { names } => {
                s.serialize(&1u8);
                s.serialize(names);
            }
            NodeHeader::Symlink { target } => {
                s.serialize(&2u8);
                s.serialize(target);
            }
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        let tag: u8 = deserializer.deserialize()?;
        match tag {
            0 => Ok(NodeHeader::File {
                executable: deserializer.deserialize()?,
            }),
            1 => Ok(NodeHeader::Directory {
                names: deserializer.deserialize()?,
            }),
            2 => Ok(NodeHeader::Symlink {
                target: deserializer.deserialize()?,
            }),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "CasFsNode",
                tag: tag as u64,
            }),
        }
    }
}

impl CasFsNode {
    /// Encode as a store object
    pub fn to_object(&self) -> CasObject {
        match self {
            CasFsNode::File {
                executable,
                contents,
            } => CasObject::new(
                serialization::to_bytes(&NodeHeader::File {
                    executable: *executable,
                }),
                vec![contents.clone()],
            ),
            CasFsNode::Directory { entries } => CasObject::new(
                serialization::to_bytes(&NodeHeader::Directory {
                    names: entries.iter().map(|(name, _)| name.clone()).collect(),
                }),
                entries.iter().map(|(_, id)| id.clone()).collect(),
            ),
            CasFsNode::Symlink { target } => CasObject::leaf(serialization::to_bytes(
                &NodeHeader::Symlink {
                    target: target.clone(),
                },
            )),
        }
    }

    /// Decode a store object previously produced by [`CasFsNode::to_object`]
    pub fn from_object(id: &DataId, object: &CasObject) -> Result<Self> {
        let invalid = |message: String| CasError::InvalidNode {
            id: id.clone(),
            message,
        };
        let header: NodeHeader = serialization::from_bytes(object.data.as_bytes())?;
        match header {
            NodeHeader::File { executable } => match object.refs.as_slice() {
                [contents] => Ok(CasFsNode::File {
                    executable,
                    contents: contents.clone(),
                }),
                refs => Err(invalid(format!("file node has {} references", refs.len()))),
            },
            NodeHeader::Directory { names } => {
                if names.len() != object.refs.len() {
                    return Err(invalid(format!(
                        "directory lists {} names but {} references",
                        names.len(),
                        object.refs.len()
                    )));
                }
                Ok(CasFsNode::Directory {
                    entries: names.into_iter().zip(object.refs.iter().cloned()).collect(),
                })
            }
            NodeHeader::Symlink { target } => Ok(CasFsNode::Symlink { target }),
        }
    }

    /// Load and decode the node stored under `id`
    pub async fn load(id: &DataId, cas: &dyn ContentStore) -> Result<Self> {
        let object = cas.load_existing(id).await?;
        Self::from_object(id, &object)
    }

    /// Import a file, directory tree or symlink, returning the root node id
    pub async fn import(path: &Path, cas: &dyn ContentStore) -> Result<DataId> {
        debug!(path = %path.display(), "importing into CAS");
        let entries: Vec<walkdir::DirEntry> = WalkDir::new(path)
            .follow_links(false)
            .contents_first(true)
            .sort_by_file_name()
            .into_iter()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("file system loop"))
            })?;

        // Children are visited before their parent and in name order, so each
        // directory's pending list is complete and sorted when it is reached.
        let mut pending: HashMap<PathBuf, Vec<(String, DataId)>> = HashMap::new();
        let mut root = None;

        for entry in entries {
            let entry_path = entry.path();
            let file_type = entry.file_type();
            let node = if file_type.is_symlink() {
                CasFsNode::Symlink {
                    target: tokio::fs::read_link(entry_path).await?,
                }
            } else if file_type.is_dir() {
                CasFsNode::Directory {
                    entries: pending.remove(entry_path).unwrap_or_default(),
                }
            } else if file_type.is_file() {
                let bytes = tokio::fs::read(entry_path).await?;
                let contents = cas.store(CasObject::leaf(bytes)).await?;
                CasFsNode::File {
                    executable: is_executable(entry_path).await?,
                    contents,
                }
            } else {
                return Err(CasError::UnsupportedFileType(entry_path.to_path_buf()));
            };

            let id = cas.store(node.to_object()).await?;
            if entry.depth() == 0 {
                root = Some(id);
            } else if let Some(parent) = entry_path.parent() {
                let name = entry.file_name().to_string_lossy().into_owned();
                pending
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push((name, id));
            }
        }

        root.ok_or_else(|| {
            CasError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("nothing to import at {}", path.display()),
            ))
        })
    }

    /// Materialize the tree stored under `id` at `dest`, replacing whatever is there
    pub async fn export(id: &DataId, cas: &dyn ContentStore, dest: &Path) -> Result<()> {
        debug!(id = %id, dest = %dest.display(), "exporting from CAS");
        remove_existing(dest).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut stack = vec![(id.clone(), dest.to_path_buf())];
        while let Some((id, path)) = stack.pop() {
            match Self::load(&id, cas).await? {
                CasFsNode::File {
                    executable,
                    contents,
                } => {
                    let blob = cas.load_existing(&contents).await?;
                    tokio::fs::write(&path, blob.data.as_bytes()).await?;
                    if executable {
                        set_executable(&path).await?;
                    }
                }
                CasFsNode::Directory { entries } => {
                    tokio::fs::create_dir_all(&path).await?;
                    for (name, child) in entries {
                        stack.push((child, path.join(name)));
                    }
                }
                CasFsNode::Symlink { target } => create_symlink(&target, &path).await?,
            }
        }
        Ok(())
    }
}

/// Remove a file, symlink or directory tree if present
pub async fn remove_existing(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
async fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(target: &Path, path: &Path) -> Result<()> {
    tokio::fs::symlink(target, path).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(target: &Path, path: &Path) -> Result<()> {
    Err(CasError::UnsupportedFileType(path.join(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCas;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        let src = temp.path().join("a.o");
        write(&src, "object code");

        let id = CasFsNode::import(&src, &cas).await.unwrap();
        let dest = temp.path().join("out").join("a.o");
        CasFsNode::export(&id, &cas, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest).unwrap(), "object code");
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        let src = temp.path().join("tree");
        write(&src.join("b.txt"), "b");
        write(&src.join("nested/c.txt"), "c");
        std::fs::create_dir_all(src.join("empty")).unwrap();

        let id = CasFsNode::import(&src, &cas).await.unwrap();
        let dest = temp.path().join("copy");
        CasFsNode::export(&id, &cas, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("b.txt")).unwrap(), "b");
        assert_eq!(std::fs::read_to_string(dest.join("nested/c.txt")).unwrap(), "c");
        assert!(dest.join("empty").is_dir());

        match CasFsNode::load(&id, &cas).await.unwrap() {
            CasFsNode::Directory { entries } => {
                let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["b.txt", "empty", "nested"]);
            }
            other => panic!("expected directory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identical_trees_share_ids() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        write(&temp.path().join("one/x.txt"), "same");
        write(&temp.path().join("two/x.txt"), "same");

        let a = CasFsNode::import(&temp.path().join("one"), &cas).await.unwrap();
        let b = CasFsNode::import(&temp.path().join("two"), &cas).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_content_change_changes_id() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        let path = temp.path().join("input.c");
        write(&path, "int x;");
        let a = CasFsNode::import(&path, &cas).await.unwrap();
        write(&path, "int y;");
        let b = CasFsNode::import(&path, &cas).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_export_replaces_existing_directory() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        let src = temp.path().join("src.txt");
        write(&src, "fresh");
        let id = CasFsNode::import(&src, &cas).await.unwrap();

        let dest = temp.path().join("dest");
        write(&dest.join("stale.txt"), "stale");
        CasFsNode::export(&id, &cas, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "fresh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_bit_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        let tool = temp.path().join("tool");
        write(&tool, "#!/bin/sh\n");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let id = CasFsNode::import(&tool, &cas).await.unwrap();
        let dest = temp.path().join("tool-copy");
        CasFsNode::export(&id, &cas, &dest).await.unwrap();
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[tokio::test]
    async fn test_import_missing_path_fails() {
        let temp = TempDir::new().unwrap();
        let cas = InMemoryCas::new();
        assert!(CasFsNode::import(&temp.path().join("absent"), &cas).await.is_err());
    }
}
