//! Raw document bytes.
//!
//! Keys are logical (`documents/<id>/<filename>`). [`FsObjectStore`] maps
//! each key to `<root>/<aa>/<sha256(key)>` so user-supplied filenames never
//! become filesystem paths.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Logical key for an uploaded document. Only the final path component of
/// `filename` is kept.
pub fn storage_key(document_id: &str, filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("document");
    format!("documents/{}/{}", document_id, base)
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(&digest)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write object {}", key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .with_context(|| format!("failed to read object {}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete object {}", key)),
        }
    }
}

/// Map-backed store for tests. Deletes can be made to fail a number of
/// times to exercise cleanup retries.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing_deletes: Mutex<u32>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_deletes(&self, n: u32) {
        if let Ok(mut f) = self.failing_deletes.lock() {
            *f = n;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut failing = self
                .failing_deletes
                .lock()
                .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?;
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("object store unavailable");
            }
        }
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_keeps_only_the_file_name() {
        assert_eq!(storage_key("d1", "../../etc/passwd"), "documents/d1/passwd");
        assert_eq!(storage_key("d1", "report.pdf"), "documents/d1/report.pdf");
        assert_eq!(storage_key("d1", ""), "documents/d1/document");
    }

    #[tokio::test]
    async fn fs_store_round_trip_and_idempotent_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());
        let key = storage_key("d1", "a b.pdf");
        store.put(&key, b"%PDF-1.4").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"%PDF-1.4");

        let path = store.path_for(&key);
        assert!(path.starts_with(tmp.path()));
        assert!(!path.to_string_lossy().contains("a b.pdf"));

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_failing_deletes() {
        let store = MemoryObjectStore::new();
        store.put("k", b"x").await.unwrap();
        store.fail_next_deletes(1);
        assert!(store.delete("k").await.is_err());
        assert!(store.contains("k"));
        store.delete("k").await.unwrap();
        assert!(!store.contains("k"));
    }
}
