//! Directory-backed file storage

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::FileStorage;
use crate::error::{VaultError, VaultResult};

/// Stores each image as a file below a root directory
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path onto the root, refusing anything that escapes it
    fn resolve(&self, path: &str) -> VaultResult<PathBuf> {
        let relative = Path::new(path);
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(VaultError::storage(format!(
                        "storage path escapes the image directory: {}",
                        path
                    )))
                }
            }
        }

        if resolved == self.root {
            return Err(VaultError::storage(format!("empty storage path: {:?}", path)));
        }

        Ok(resolved)
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn exists(&self, path: &str) -> VaultResult<bool> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn read_all_bytes(&self, path: &str) -> VaultResult<Vec<u8>> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(VaultError::FileNotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all_bytes(&self, path: &str, bytes: &[u8]) -> VaultResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers see the old file or the new one, never a torn write
        let mut temp_name = full.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        fs::write(&temp_path, bytes).await?;
        fs::rename(&temp_path, &full).await?;

        tracing::trace!(path, bytes = bytes.len(), "Wrote image file");
        Ok(())
    }
}
