//! Wiring of the encryption core from a configuration

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::VaultConfig;
use crate::encryption::{ImageEncryptionService, KeyStore, ProgressNotifier, RotationEngine};
use crate::monitoring::{AuditLogger, VaultMetrics};
use crate::storage::{FileStorage, LocalFileStorage, MemoryFileStorage};

/// A fully wired vault: key store, image service and rotation engine
/// sharing one catalog
pub struct Vault {
    config: VaultConfig,
    catalog: Arc<Catalog>,
    keys: Arc<KeyStore>,
    images: Arc<ImageEncryptionService>,
    rotations: RotationEngine,
    audit: Arc<AuditLogger>,
    metrics: Arc<VaultMetrics>,
}

impl Vault {
    /// Open the on-disk vault described by `config`.
    ///
    /// Must run inside a tokio runtime: rotations left in progress are
    /// resumed here when `rotation.resume_on_startup` is set.
    pub async fn open(config: VaultConfig) -> Result<Self> {
        config.validate()?;

        let catalog_path = config.storage.catalog_path();
        let catalog = Catalog::open(&catalog_path)
            .with_context(|| format!("Failed to open catalog: {}", catalog_path.display()))?;
        let storage = LocalFileStorage::new(config.storage.image_root());

        tracing::info!(
            catalog = %catalog_path.display(),
            images = %storage.root().display(),
            "Opening vault"
        );

        Self::assemble(config, catalog, Arc::new(storage), Arc::new(SystemClock))
    }

    /// Vault with an in-memory catalog and in-memory files
    pub fn in_memory(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        Self::assemble(
            config,
            Catalog::in_memory(),
            Arc::new(MemoryFileStorage::new()),
            Arc::new(SystemClock),
        )
    }

    /// Vault over caller-provided collaborators
    pub async fn with_parts(
        config: VaultConfig,
        catalog: Catalog,
        storage: Arc<dyn FileStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, catalog, storage, clock)
    }

    fn assemble(
        config: VaultConfig,
        catalog: Catalog,
        storage: Arc<dyn FileStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let catalog = Arc::new(catalog);
        let audit = Arc::new(AuditLogger::new(
            config.logging.audit_logging,
            config.logging.audit_retention,
        ));
        let metrics = Arc::new(VaultMetrics::new()?);

        let keys = Arc::new(KeyStore::new(catalog.clone(), clock.clone(), audit.clone()));
        let images = Arc::new(ImageEncryptionService::new(
            keys.clone(),
            catalog.clone(),
            storage,
            clock.clone(),
            metrics.clone(),
        ));
        let rotations = RotationEngine::new(
            config.rotation.clone(),
            catalog.clone(),
            keys.clone(),
            images.clone(),
            ProgressNotifier::new(),
            clock,
            audit.clone(),
            metrics.clone(),
        );

        let vault = Self {
            config,
            catalog,
            keys,
            images,
            rotations,
            audit,
            metrics,
        };

        if vault.config.rotation.resume_on_startup {
            let resumed = vault.rotations.resume_interrupted();
            if !resumed.is_empty() {
                tracing::info!(count = resumed.len(), "Resumed interrupted rotations");
            }
        }

        Ok(vault)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn images(&self) -> &ImageEncryptionService {
        &self.images
    }

    pub fn rotations(&self) -> &RotationEngine {
        &self.rotations
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn metrics(&self) -> &VaultMetrics {
        &self.metrics
    }

    /// Stop rotation jobs at their next batch boundary
    pub async fn close(&self) {
        self.rotations.shutdown().await;
    }
}
