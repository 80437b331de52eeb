//! Storage backends for the content store.

use super::entry::{CacheEntry, CacheMetadata};
use super::keys::sha256_hex;
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Key-addressed record storage.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads a record.
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Writes a record, replacing any previous one under the same key.
    async fn write(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Removes a record. Returns true if one existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Lists the key and metadata of every record.
    async fn list(&self) -> Result<Vec<(String, CacheMetadata)>, StoreError>;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn write(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<(String, CacheMetadata)>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().metadata.clone()))
            .collect())
    }
}

/// One JSON file per record under a root directory.
///
/// File names are the SHA-256 of the key, so any key is a safe file name.
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sha256_hex(key)))
    }

    async fn read_path(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entry = Self::read_path(&self.path_for(key)).await?;
        Ok(entry.filter(|e| e.key == key))
    }

    async fn write(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.path_for(&entry.key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(String, CacheMetadata)>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_path(&path).await {
                Ok(Some(entry)) => records.push((entry.key, entry.metadata)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache record"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryKind;
    use serde_json::json;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, json!({"k": key}), CacheMetadata::new(EntryKind::StepResult))
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let backend = InMemoryBackend::new();
        backend.write(&entry("a")).await.unwrap();

        assert_eq!(backend.read("a").await.unwrap().unwrap().value, json!({"k": "a"}));
        assert!(backend.read("b").await.unwrap().is_none());
        assert!(backend.remove("a").await.unwrap());
        assert!(!backend.remove("a").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");

        FileBackend::new(&root).write(&entry("checkpoint:run-1")).await.unwrap();

        let reopened = FileBackend::new(&root);
        let loaded = reopened.read("checkpoint:run-1").await.unwrap().unwrap();
        assert_eq!(loaded.key, "checkpoint:run-1");

        let listed = reopened.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "checkpoint:run-1");
    }

    #[tokio::test]
    async fn test_file_backend_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("absent"));

        assert!(backend.read("x").await.unwrap().is_none());
        assert!(backend.list().await.unwrap().is_empty());
        assert!(!backend.remove("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backend_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        backend.write(&entry("a")).await.unwrap();

        tokio::fs::write(backend.path_for("a"), b"{not json").await.unwrap();

        assert!(matches!(
            backend.read("a").await,
            Err(StoreError::Serialization(_))
        ));
        assert!(backend.list().await.unwrap().is_empty());
    }
}
