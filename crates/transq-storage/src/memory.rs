//! In-process object storage.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::storage::ObjectStorage;

/// In-memory [`ObjectStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object without going through the trait.
    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.lock().insert(key.into(), data.into());
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.put(key, data);
        Ok(())
    }
}
