//! In-memory file storage

use async_trait::async_trait;
use dashmap::DashMap;

use super::FileStorage;
use crate::error::{VaultError, VaultResult};

/// File storage held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    files: DashMap<String, Vec<u8>>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path).map(|(_, bytes)| bytes)
    }

    /// Raw stored bytes, bypassing the trait
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    async fn exists(&self, path: &str) -> VaultResult<bool> {
        Ok(self.files.contains_key(path))
    }

    async fn read_all_bytes(&self, path: &str) -> VaultResult<Vec<u8>> {
        self.get(path)
            .ok_or_else(|| VaultError::FileNotFound(path.to_string()))
    }

    async fn write_all_bytes(&self, path: &str, bytes: &[u8]) -> VaultResult<()> {
        self.files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}
