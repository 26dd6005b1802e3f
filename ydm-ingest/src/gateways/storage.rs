//! Blob storage capability
//!
//! Keys are relative `/`-separated paths such as
//! `datasets/{dataset_id}/images/train/img1.jpg`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use ydm_common::{Error, Result};

/// Owned byte stream passed into and out of storage
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Store `bytes` under `path`, replacing any previous object; returns its location
    async fn put(&self, path: &str, bytes: ByteStream) -> Result<String>;

    /// Open a stored object
    async fn get(&self, location: &str) -> Result<ByteStream>;

    /// Remove every object under `prefix`; missing prefixes are not an error
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Reject keys that could escape the storage root
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(Error::InvalidInput(format!("invalid storage key '{}'", key)));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(Error::InvalidInput(format!("invalid storage key '{}'", key)));
    }
    Ok(())
}

/// Objects as files under a root directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl StorageGateway for LocalStorage {
    async fn put(&self, path: &str, mut bytes: ByteStream) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never see a half-written object
        let mut partial_name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        partial_name.push(".partial");
        let partial = target.with_file_name(partial_name);
        let mut file = tokio::fs::File::create(&partial).await?;
        let copied = tokio::io::copy(&mut bytes, &mut file).await;
        if let Err(e) = copied {
            drop(file);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        Ok(path.to_string())
    }

    async fn get(&self, location: &str) -> Result<ByteStream> {
        let path = self.resolve(location)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object '{}'", location)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix.trim_end_matches('/'))?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Objects held in process memory
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys in lexical order
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn put(&self, path: &str, mut bytes: ByteStream) -> Result<String> {
        validate_key(path)?;
        let mut buffer = Vec::new();
        bytes.read_to_end(&mut buffer).await?;
        self.objects.write().await.insert(path.to_string(), buffer);
        Ok(path.to_string())
    }

    async fn get(&self, location: &str) -> Result<ByteStream> {
        let objects = self.objects.read().await;
        let bytes = objects
            .get(location)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object '{}'", location)))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.objects
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    fn bytes(data: &'static [u8]) -> ByteStream {
        Box::new(data)
    }

    async fn exercise(storage: &dyn StorageGateway) {
        let location = storage
            .put("datasets/d1/images/train/a.jpg", bytes(b"jpeg"))
            .await
            .unwrap();
        storage
            .put("datasets/d2/images/a.jpg", bytes(b"other"))
            .await
            .unwrap();

        assert_eq!(read_all(storage.get(&location).await.unwrap()).await, b"jpeg");

        storage.delete_prefix("datasets/d1").await.unwrap();
        assert!(matches!(storage.get(&location).await, Err(Error::NotFound(_))));
        assert!(storage.get("datasets/d2/images/a.jpg").await.is_ok());

        // Deleting again is fine
        storage.delete_prefix("datasets/d1").await.unwrap();
    }

    #[tokio::test]
    async fn local_storage_round_trip() {
        let dir = TempDir::new().unwrap();
        exercise(&LocalStorage::new(dir.path())).await;
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        for key in ["../escape", "/abs/path", "a//b", "a/./b", "a\\b", ""] {
            assert!(
                storage.put(key, bytes(b"x")).await.is_err(),
                "accepted {:?}",
                key
            );
        }
    }

    #[tokio::test]
    async fn memory_prefix_delete_does_not_match_siblings() {
        let storage = MemoryStorage::new();
        storage.put("datasets/d1/x", bytes(b"1")).await.unwrap();
        storage.put("datasets/d10/x", bytes(b"2")).await.unwrap();

        storage.delete_prefix("datasets/d1").await.unwrap();

        assert_eq!(storage.keys().await, vec!["datasets/d10/x".to_string()]);
    }
}
