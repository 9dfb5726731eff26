//! File storage for image payloads
//!
//! Storage paths are opaque strings to the encryption core. Files are only
//! ever read whole and overwritten whole.

pub mod local;
pub mod memory;

pub use local::LocalFileStorage;
pub use memory::MemoryFileStorage;

use async_trait::async_trait;

use crate::error::VaultResult;

/// Whole-file access to image payloads
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn exists(&self, path: &str) -> VaultResult<bool>;

    /// Read the complete file; `FileNotFound` if there is none
    async fn read_all_bytes(&self, path: &str) -> VaultResult<Vec<u8>>;

    /// Create or replace the complete file
    async fn write_all_bytes(&self, path: &str, bytes: &[u8]) -> VaultResult<()>;
}
