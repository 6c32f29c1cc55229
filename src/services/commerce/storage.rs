use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::ServiceError;

/// Storage key of the serialized cart rows.
pub const CART_STORAGE_KEY: &str = "lindas-cart";
/// Storage key of the serialized wishlist.
pub const WISHLIST_STORAGE_KEY: &str = "lindas-wishlist";

/// Durable key/value store for the cart and wishlist JSON documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartStorage: Send + Sync {
    /// Returns `None` when nothing has been stored under `key` yet.
    async fn load(&self, key: &str) -> Result<Option<String>, ServiceError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), ServiceError>;
    async fn remove(&self, key: &str) -> Result<(), ServiceError>;
}

/// One `<key>.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileCartStorage {
    dir: PathBuf,
}

impl FileCartStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl CartStorage for FileCartStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, ServiceError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServiceError::StorageError(format!(
                "Failed to read {}: {}",
                key, e
            ))),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), ServiceError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ServiceError::StorageError(format!("Failed to create storage dir: {}", e)))?;

        // Write to a sibling file first so a crash never leaves half a document.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| ServiceError::StorageError(format!("Failed to write {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ServiceError::StorageError(format!("Failed to replace {}: {}", key, e)))?;

        debug!(key, bytes = value.len(), "Persisted storage document");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ServiceError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::StorageError(format!(
                "Failed to remove {}: {}",
                key, e
            ))),
        }
    }
}

/// Process-local storage, for tests and hosts without a writable disk.
#[derive(Debug, Default)]
pub struct InMemoryCartStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryCartStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a raw document, e.g. to simulate corrupted storage.
    pub async fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl CartStorage for InMemoryCartStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, ServiceError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), ServiceError> {
        self.insert_raw(key, value).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ServiceError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
