//! Object storage abstraction.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Key/value blob store addressed by object key.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Read an object. `NotFound` if the key does not exist.
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Write an object, replacing any existing one.
    async fn write(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Download an object into a local file.
    async fn download_to(&self, key: &str, path: &Path) -> StorageResult<()> {
        let bytes = self.read(key).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::download_failed(format!("Failed to create directory: {}", e))
            })?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StorageError::download_failed(format!("Failed to write file: {}", e)))?;

        debug!("Downloaded {} to {}", key, path.display());
        Ok(())
    }

    /// Upload a local file as an object.
    async fn upload_from(&self, path: &Path, key: &str) -> StorageResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::upload_failed(format!("Failed to read file: {}", e)))?;
        self.write(key, bytes).await
    }
}
