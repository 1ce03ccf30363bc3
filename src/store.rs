//! Sandboxed read access to the served filesystem tree

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// What a resolved path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Filesystem metadata the handler needs.
#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: EntryKind,
    pub len: u64,
    pub modified: SystemTime,
}

impl From<&std::fs::Metadata> for Stat {
    fn from(metadata: &std::fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        Self {
            kind,
            len: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

/// Reads files and metadata below a single root directory. Every path it
/// hands out is a descendant of that root.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a store rooted at `root`. The root is canonicalized so that
    /// containment checks compare real paths.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| {
            Error::Config(format!("cannot open root {}: {}", root.display(), e))
        })?;
        if !canonical.is_dir() {
            return Err(Error::Config(format!(
                "root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Join a decoded URL path onto the root, resolving `.` and `..`
    /// lexically. A `..` that would climb above the root is rejected.
    pub fn resolve(&self, url_path: &str) -> Result<PathBuf> {
        if url_path.contains('\0') {
            return Err(Error::BadRequest("NUL byte in path".into()));
        }

        let mut stack: Vec<&str> = Vec::new();
        for part in url_path.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    if stack.pop().is_none() {
                        return Err(Error::Forbidden {
                            path: url_path.to_string(),
                        });
                    }
                }
                other => stack.push(other),
            }
        }

        let mut resolved = self.root.clone();
        for part in stack {
            resolved.push(part);
        }

        // Only plain names may follow the root.
        let escapes = resolved
            .strip_prefix(&self.root)
            .map(|rel| {
                rel.components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            })
            .unwrap_or(true);
        if escapes {
            return Err(Error::Forbidden {
                path: url_path.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Metadata of `path` itself, without following a final symlink.
    pub async fn stat(&self, path: &Path, url_path: &str) -> Result<Stat> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| Error::from_fs(e, url_path))?;
        Ok(Stat::from(&metadata))
    }

    /// Resolve every symlink on `path` and require the real target to stay
    /// inside the root. Returns the real path and its metadata.
    pub async fn confine(&self, path: &Path, url_path: &str) -> Result<(PathBuf, Stat)> {
        let real = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| Error::from_fs(e, url_path))?;
        if !self.contains(&real) {
            return Err(Error::Forbidden {
                path: url_path.to_string(),
            });
        }
        let metadata = tokio::fs::metadata(&real)
            .await
            .map_err(|e| Error::from_fs(e, url_path))?;
        Ok((real, Stat::from(&metadata)))
    }

    pub async fn read(&self, path: &Path, url_path: &str) -> Result<Vec<u8>> {
        if !self.contains(path) {
            return Err(Error::Forbidden {
                path: url_path.to_string(),
            });
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::from_fs(e, url_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_resolve_normalizes_dots() {
        let (_dir, store) = store();
        assert_eq!(store.resolve("/").unwrap(), store.root());
        assert_eq!(
            store.resolve("/css/./style.css").unwrap(),
            store.root().join("css/style.css")
        );
        assert_eq!(
            store.resolve("/a/b/../c.txt").unwrap(),
            store.root().join("a/c.txt")
        );
        assert_eq!(
            store.resolve("//double//slash").unwrap(),
            store.root().join("double/slash")
        );
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let (_dir, store) = store();
        for path in ["/../etc/passwd", "/../../etc/passwd", "/a/../../b", "../x"] {
            assert!(
                matches!(store.resolve(path), Err(Error::Forbidden { .. })),
                "{} should be forbidden",
                path
            );
        }
    }

    #[test]
    fn test_resolve_rejects_nul() {
        let (_dir, store) = store();
        assert!(matches!(
            store.resolve("/etc/passwd\0.txt"),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_backslashes_are_plain_characters() {
        let (_dir, store) = store();
        let resolved = store.resolve("/\\..\\..\\secret").unwrap();
        assert!(store.contains(&resolved));
    }

    #[test]
    fn test_open_rejects_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(ContentStore::open(&file), Err(Error::Config(_))));
        assert!(ContentStore::open(dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_stat_missing_is_not_found() {
        let (_dir, store) = store();
        let path = store.resolve("/nope.html").unwrap();
        assert!(matches!(
            store.stat(&path, "/nope.html").await,
            Err(Error::NotFound { .. })
        ));
    }
}
