//! File system access for task actions

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::Result;

/// The file system operations task actions perform
#[async_trait]
pub trait FsProxy: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Copy a file or directory tree; the destination must not exist
    async fn copy(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a file or symlink
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree
    async fn remove_directory(&self, path: &Path) -> Result<()>;

    async fn create_directory(&self, path: &Path, recursive: bool) -> Result<()>;

    async fn is_directory(&self, path: &Path) -> bool;

    async fn exists(&self, path: &Path) -> bool;

    async fn realpath(&self, path: &Path) -> Result<PathBuf>;
}

/// The local file system
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl FsProxy for LocalFs {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        Ok(tokio::fs::write(path, contents).await?)
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from = from.to_path_buf();
        let to = to.to_path_buf();
        tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
            .await
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))??;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        Ok(tokio::fs::remove_dir_all(path).await?)
    }

    async fn create_directory(&self, path: &Path, recursive: bool) -> Result<()> {
        if recursive {
            tokio::fs::create_dir_all(path).await?;
        } else {
            match tokio::fs::create_dir(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn is_directory(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn realpath(&self, path: &Path) -> Result<PathBuf> {
        Ok(tokio::fs::canonicalize(path).await?)
    }
}

/// Resolve `.` and `..` components without touching the file system
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        let dest = if relative.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(relative)
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            symlink(&std::fs::read_link(entry.path())?, &dest)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::copy(target, link).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_directory_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("nested/b.txt"), "b").unwrap();

        let dest = temp.path().join("dest");
        LocalFs.copy(&src, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dest.join("nested/b.txt")).unwrap(), "b");
        assert!(LocalFs.is_directory(&dest).await);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("./a/../b")), Path::new("b"));
        assert_eq!(normalize_path(Path::new("/x/./y/../z")), Path::new("/x/z"));
        assert_eq!(normalize_path(Path::new("/../a")), Path::new("/a"));
        assert_eq!(normalize_path(Path::new("../a/..")), Path::new(".."));
        assert_eq!(normalize_path(Path::new("a//b/")), Path::new("a/b"));
    }

    #[tokio::test]
    async fn test_copy_single_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        std::fs::write(&src, "a").unwrap();
        let dest = temp.path().join("b.txt");
        LocalFs.copy(&src, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_keeps_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::os::unix::fs::symlink("a.txt", src.join("link")).unwrap();

        let dest = temp.path().join("dest");
        LocalFs.copy(&src, &dest).await.unwrap();

        let link = dest.join("link");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("a.txt"));
        assert_eq!(std::fs::read_to_string(link).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("x/y");
        LocalFs.create_directory(&dir, true).await.unwrap();
        LocalFs.write(&dir.join("f"), b"data").await.unwrap();
        assert_eq!(LocalFs.read(&dir.join("f")).await.unwrap(), b"data");

        LocalFs.remove(&dir.join("f")).await.unwrap();
        assert!(!LocalFs.exists(&dir.join("f")).await);
        LocalFs.remove_directory(&temp.path().join("x")).await.unwrap();
        assert!(!LocalFs.exists(&dir).await);
    }
}
