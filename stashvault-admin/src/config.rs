use anyhow::Result;
use stashvault_core::VaultConfig;
use std::path::{Path, PathBuf};

/// Load the vault configuration the CLI runs against.
///
/// A missing file means defaults; `data_dir` overrides the file.
pub fn load(path: &Path, data_dir: Option<PathBuf>, verbose: bool) -> Result<VaultConfig> {
    let mut config = if path.exists() {
        VaultConfig::load(path)?
    } else {
        VaultConfig::default()
    };

    if let Some(data_dir) = data_dir {
        config.storage.data_dir = data_dir;
    }

    if verbose {
        config.logging.level = "DEBUG".to_string();
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load(&temp_dir.path().join("absent.toml"), None, false).unwrap();
        assert_eq!(config, VaultConfig::default());
    }

    #[test]
    fn test_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stashvault.toml");
        std::fs::write(&path, "[rotation]\ndefault_batch_size = 7\n").unwrap();

        let config = load(&path, Some(temp_dir.path().join("vault")), true).unwrap();
        assert_eq!(config.rotation.default_batch_size, 7);
        assert_eq!(config.storage.data_dir, temp_dir.path().join("vault"));
        assert_eq!(config.logging.level, "DEBUG");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stashvault.toml");
        std::fs::write(&path, "[rotation]\ndefault_batch_size = 0\n").unwrap();

        assert!(load(&path, None, false).is_err());
    }
}
