//! Object store collaborator.
//!
//! The store exposes exactly one capability: a streaming writer for an
//! object path. The output sink pipes engine exports straight into the
//! writer so large images are never buffered in memory.

use crate::error::{KilnError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWrite;

/// A streaming sink for one object.
pub type ObjectWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bucket-like handle with streaming object writers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streaming writer for the object at `path`. Parent prefixes
    /// are created implicitly. Dropping the writer without flushing may
    /// leave a partial object; callers shut the writer down explicitly.
    async fn object_writer(&self, path: &str) -> Result<ObjectWriter>;

    /// Human-readable location of an object, used for artifact references.
    fn object_url(&self, path: &str) -> String;
}

/// Filesystem-backed store rooted at a local directory. Doubles as the dev
/// deployment target (point it at a mounted bucket) and the test double.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn object_writer(&self, path: &str) -> Result<ObjectWriter> {
        let target = crate::archive::sanitize_entry_path(&self.root, std::path::Path::new(path))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(parent, e))?;
        }
        let file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| KilnError::io(&target, e))?;
        Ok(Box::new(file))
    }

    fn object_url(&self, path: &str) -> String {
        self.root.join(path).to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_fs_store_writes_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let mut writer = store.object_writer("images/demo-1.tar").await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.shutdown().await.unwrap();

        let written = std::fs::read(dir.path().join("images/demo-1.tar")).unwrap();
        assert_eq!(written, b"payload");
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.object_writer("../outside.tar").await.is_err());
    }
}
