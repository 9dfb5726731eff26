//! Configuration management for StashVault
//!
//! This module provides:
//! - TOML configuration with defaults for every section
//! - Validation on load and on every update
//! - Single-setting edits through `ConfigManager`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::encryption::key_rotation::RotationConfig;
use crate::monitoring::logging::LoggingConfig;

/// StashVault configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Where the catalog and image files live
    pub storage: StorageSettings,
    /// Rotation engine behaviour
    pub rotation: RotationConfig,
    /// Logging and audit settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory
    pub data_dir: PathBuf,
    /// Image directory, relative to `data_dir` unless absolute
    pub image_dir: PathBuf,
    /// Catalog file, relative to `data_dir` unless absolute
    pub catalog_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            image_dir: PathBuf::from("images"),
            catalog_file: PathBuf::from("catalog.jsonl"),
        }
    }
}

impl StorageSettings {
    pub fn image_root(&self) -> PathBuf {
        self.data_dir.join(&self.image_dir)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(&self.catalog_file)
    }
}

impl VaultConfig {
    /// Configuration rooted at `data_dir` with every other setting defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Data directory cannot be empty"));
        }

        if self.storage.catalog_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Catalog file cannot be empty"));
        }

        if self.storage.image_root() == self.storage.data_dir {
            return Err(anyhow::anyhow!("Image directory must differ from the data directory"));
        }

        if self.rotation.default_batch_size == 0 {
            return Err(anyhow::anyhow!("Default batch size cannot be 0"));
        }

        if self.rotation.batch_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("Batch delay cannot exceed 60000 ms"));
        }

        let level = self.logging.level.to_uppercase();
        if !["ERROR", "WARN", "INFO", "DEBUG", "TRACE"].contains(&level.as_str()) {
            return Err(anyhow::anyhow!("Unknown log level: {}", self.logging.level));
        }

        if self.logging.audit_logging && self.logging.audit_retention == 0 {
            return Err(anyhow::anyhow!("Audit retention cannot be 0 while audit logging is on"));
        }

        Ok(())
    }

    /// Set one `section.field` setting from its TOML spelling.
    ///
    /// Text that is not a TOML value is taken as a string, so
    /// `logging.level DEBUG` needs no quotes.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let (section, field) = key
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Setting must look like section.field: {}", key))?;

        let mut document =
            toml::Value::try_from(&*self).context("Failed to serialize configuration")?;
        let table = document
            .get_mut(section)
            .and_then(toml::Value::as_table_mut)
            .ok_or_else(|| anyhow::anyhow!("Unknown configuration section: {}", section))?;
        let slot = table
            .get_mut(field)
            .ok_or_else(|| anyhow::anyhow!("Unknown setting: {}", key))?;
        *slot = parse_setting(raw);

        *self = document
            .try_into()
            .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
        Ok(())
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: VaultConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

fn parse_setting(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {}", raw))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Configuration manager
pub struct ConfigManager {
    config: Arc<RwLock<VaultConfig>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load the file at `config_path`, writing defaults there if it does not exist
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            VaultConfig::load(&config_path)?
        } else {
            let default_config = VaultConfig::default();
            default_config.save(&config_path)?;
            info!("Wrote default configuration to {}", config_path.display());
            default_config
        };

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub async fn get_config(&self) -> VaultConfig {
        self.config.read().await.clone()
    }

    /// Apply `updater` to a copy, validate, then save.
    ///
    /// Nothing changes if the updater or validation fails. Returns whether
    /// an open vault only picks the change up after reopening.
    pub async fn update_config<F>(&self, section: &str, updater: F) -> Result<bool>
    where
        F: FnOnce(&mut VaultConfig) -> Result<()>,
    {
        let mut config = self.config.write().await;
        let mut candidate = config.clone();

        updater(&mut candidate)?;
        candidate.validate()?;
        candidate.save(&self.config_path)?;
        *config = candidate;

        let restart_required = Self::requires_restart(section);
        info!("Configuration updated: section={}, restart_required={}", section, restart_required);

        Ok(restart_required)
    }

    /// Whether a change to `section` only takes effect after reopening the vault
    pub fn requires_restart(section: &str) -> bool {
        let restart_sections = ["storage", "rotation", "logging.json_format"];
        restart_sections.iter().any(|&s| section.starts_with(s))
    }
}
