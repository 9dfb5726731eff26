//! Key rotation engine
//!
//! Starts batch re-encryption jobs in the background and tracks them
//! through persisted rotation rows:
//! - Migration mode encrypts images that were never encrypted
//! - Rotation mode moves images from one key to the Active key
//! - Cooperative cancellation at batch boundaries
//! - Resumption of rows left in progress by a previous process

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, ImageSource};
use crate::clock::Clock;
use crate::encryption::image_encryption::ImageEncryptionService;
use crate::encryption::key_store::{KeyStatus, KeyStore};
use crate::encryption::progress::{ProgressNotifier, ProgressSink};
use crate::encryption::rotation_state::{EncryptionKeyRotation, RotationProgress, RotationStatus};
use crate::encryption::rotation_worker::{JobContext, RotationJob};
use crate::error::{VaultError, VaultResult};
use crate::monitoring::audit::{AuditEvent, AuditLogger};
use crate::monitoring::metrics::VaultMetrics;

/// Key rotation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Images per batch when a request does not name one (default: 100)
    pub default_batch_size: usize,

    /// Pause between batches in milliseconds (default: 0)
    pub batch_delay_ms: u64,

    /// Start a rotation off the previous key whenever a key is activated
    pub auto_rotate_on_activation: bool,

    /// Allow rotations whose keys overlap an in-progress one
    pub allow_concurrent_rotations: bool,

    /// Restart jobs for in-progress rows when the vault opens
    pub resume_on_startup: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            batch_delay_ms: 0,
            auto_rotate_on_activation: false,
            allow_concurrent_rotations: false,
            resume_on_startup: true,
        }
    }
}

/// Request to start a rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRotation {
    /// None or 0 selects migration mode
    pub from_key_id: Option<i64>,
    pub to_key_id: i64,
    /// Falls back to `RotationConfig::default_batch_size`
    pub batch_size: Option<usize>,
    pub initiated_by: String,
    pub is_automatic: bool,
}

impl StartRotation {
    /// Encrypt every never-encrypted image with `to_key_id`
    pub fn migration(to_key_id: i64, initiated_by: impl Into<String>) -> Self {
        Self {
            from_key_id: None,
            to_key_id,
            batch_size: None,
            initiated_by: initiated_by.into(),
            is_automatic: false,
        }
    }

    /// Move every image sealed with `from_key_id` onto `to_key_id`
    pub fn rotation(from_key_id: i64, to_key_id: i64, initiated_by: impl Into<String>) -> Self {
        Self {
            from_key_id: Some(from_key_id),
            to_key_id,
            batch_size: None,
            initiated_by: initiated_by.into(),
            is_automatic: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Rotation engine
pub struct RotationEngine {
    config: RotationConfig,
    keys: Arc<KeyStore>,
    ctx: JobContext,
    jobs: DashMap<Uuid, JoinHandle<()>>,
}

impl RotationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RotationConfig,
        catalog: Arc<Catalog>,
        keys: Arc<KeyStore>,
        images: Arc<ImageEncryptionService>,
        notifier: ProgressNotifier,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
        metrics: Arc<VaultMetrics>,
    ) -> Self {
        let ctx = JobContext {
            catalog,
            images,
            notifier,
            clock,
            audit,
            metrics,
            shutdown: CancellationToken::new(),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        };

        Self {
            config,
            keys,
            ctx,
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        &self.ctx.notifier
    }

    /// Validate, persist an `InProgress` row, and launch its batch job.
    ///
    /// Returns once the row is committed; no image has been processed yet.
    pub async fn start_rotation(&self, request: StartRotation) -> VaultResult<EncryptionKeyRotation> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(VaultError::invalid_state("rotation engine is shutting down"));
        }

        let batch_size = request.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 {
            return Err(VaultError::invalid_state("batch size must be at least 1"));
        }

        let from_key_id = request.from_key_id.filter(|kid| *kid != 0);
        let to_key_id = request.to_key_id;
        let initiated_by = request.initiated_by;
        let is_automatic = request.is_automatic;
        let allow_concurrent = self.config.allow_concurrent_rotations;
        let now = self.ctx.clock.now();

        let rotation = self.ctx.catalog.spawn_transaction(move |state| {
            let target = state
                .key(to_key_id)
                .ok_or(VaultError::TargetKeyNotFound(to_key_id))?;

            let source = match from_key_id {
                None => {
                    if target.status != KeyStatus::Active {
                        return Err(VaultError::invalid_state(format!(
                            "target key {} is not active",
                            to_key_id
                        )));
                    }
                    ImageSource::Unencrypted
                }
                Some(from) => {
                    if state.key(from).is_none() {
                        return Err(VaultError::SourceKeyNotFound(from));
                    }
                    if from == to_key_id {
                        return Err(VaultError::invalid_state(format!(
                            "source and target key are both {}",
                            from
                        )));
                    }
                    if target.status != KeyStatus::Active {
                        // Re-encryption always seals with the Active key
                        let active = state.active_key().ok_or(VaultError::NoActiveKey)?;
                        if active.kid == from {
                            return Err(VaultError::invalid_state(format!(
                                "no image would leave key {}: it is the active key and target key {} is {}",
                                from, to_key_id, target.status
                            )));
                        }
                        tracing::warn!(
                            to_key_id,
                            status = %target.status,
                            active_kid = active.kid,
                            "Rotation target is not active; images will move to the active key"
                        );
                    }
                    ImageSource::EncryptedWith(from)
                }
            };

            if !allow_concurrent {
                if let Some(running) = state.in_progress_rotations().find(|r| {
                    r.source() == source
                        || r.to_key_id == to_key_id
                        || r.from_key_id == Some(to_key_id)
                        || from_key_id == Some(r.to_key_id)
                }) {
                    return Err(VaultError::invalid_state(format!(
                        "rotation {} is already in progress for an overlapping key",
                        running.id
                    )));
                }
            }

            let rotation = EncryptionKeyRotation {
                id: Uuid::new_v4(),
                from_key_id,
                to_key_id,
                status: RotationStatus::InProgress,
                total_images: state.count_source(source),
                processed_images: 0,
                failed_images: 0,
                batch_size,
                initiated_by,
                is_automatic,
                started_at: now,
                completed_at: None,
                error_message: None,
            };
            state.insert_rotation(rotation.clone());
            Ok(rotation)
        })
        .await?;

        tracing::info!(
            rotation_id = %rotation.id,
            from_key_id = ?rotation.from_key_id,
            to_key_id = rotation.to_key_id,
            total_images = rotation.total_images,
            batch_size,
            "Rotation started"
        );
        self.ctx.metrics.rotation_started();
        self.ctx.audit.log_event(AuditEvent::RotationStarted {
            rotation_id: rotation.id,
            from_key_id: rotation.from_key_id,
            to_key_id: rotation.to_key_id,
            total_images: rotation.total_images,
            initiated_by: rotation.initiated_by.clone(),
            is_automatic: rotation.is_automatic,
            timestamp: now,
        });

        self.spawn_job(rotation.id);
        Ok(rotation)
    }

    /// Activate `kid`, then rotate off the previously Active key when
    /// automatic rotation is enabled.
    ///
    /// Once the activation commits this returns `Ok`. If the follow-up
    /// rotation cannot start (for example the overlap guard refuses it) the
    /// reason is logged and the result is `Ok(None)`.
    pub async fn activate_key_and_rotate(
        &self,
        kid: i64,
        initiated_by: &str,
    ) -> VaultResult<Option<EncryptionKeyRotation>> {
        let previous = self.keys.get_active_key();

        if !self.keys.activate_key(kid)? {
            return Err(VaultError::KeyNotFound(kid));
        }

        if !self.config.auto_rotate_on_activation {
            return Ok(None);
        }

        match previous {
            Some(previous) if previous.kid != kid => {
                let request = StartRotation {
                    from_key_id: Some(previous.kid),
                    to_key_id: kid,
                    batch_size: None,
                    initiated_by: initiated_by.to_string(),
                    is_automatic: true,
                };
                match self.start_rotation(request).await {
                    Ok(rotation) => Ok(Some(rotation)),
                    Err(e) => {
                        tracing::warn!(
                            kid,
                            previous_kid = previous.kid,
                            error = %e,
                            "Key activated but the automatic rotation was not started"
                        );
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    pub fn get_rotation(&self, rotation_id: Uuid) -> Option<EncryptionKeyRotation> {
        self.ctx
            .catalog
            .read(|state| state.rotation(rotation_id).cloned())
    }

    pub fn get_progress(&self, rotation_id: Uuid) -> Option<RotationProgress> {
        self.get_rotation(rotation_id).map(|r| r.progress())
    }

    /// Rotations, newest first, optionally limited to one status
    pub fn list_rotations(&self, status: Option<RotationStatus>) -> Vec<EncryptionKeyRotation> {
        let mut rotations: Vec<EncryptionKeyRotation> = self.ctx.catalog.read(|state| {
            state
                .rotations()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect()
        });
        rotations.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rotations
    }

    /// Request a cooperative stop. False if unknown or already terminal.
    pub fn cancel_rotation(&self, rotation_id: Uuid) -> VaultResult<bool> {
        let now = self.ctx.clock.now();

        let cancelled = self.ctx.catalog.transaction(|state| {
            let Some(rotation) = state.rotation_mut(rotation_id) else {
                return Ok(None);
            };
            if rotation.status != RotationStatus::InProgress {
                return Ok(None);
            }
            rotation.status = RotationStatus::Cancelled;
            rotation.completed_at = Some(now);
            Ok(Some(rotation.progress()))
        })?;

        let Some(snapshot) = cancelled else {
            return Ok(false);
        };

        tracing::info!(%rotation_id, processed = snapshot.processed_images, "Rotation cancelled");
        self.ctx.notifier.notify_progress(rotation_id, snapshot);
        self.ctx.metrics.rotation_finished(RotationStatus::Cancelled);
        self.ctx.audit.log_event(AuditEvent::RotationCancelled {
            rotation_id,
            timestamp: now,
        });
        Ok(true)
    }

    /// Stream live progress for a rotation into `sink`.
    ///
    /// The current snapshot is delivered first; a rotation that is already
    /// terminal yields that one snapshot and the stream ends.
    pub async fn stream_progress(
        &self,
        rotation_id: Uuid,
        sink: &mut dyn ProgressSink,
        cancel: CancellationToken,
    ) -> VaultResult<()> {
        // Claim the mailbox before reading the row so no transition is missed
        let subscription = self.ctx.notifier.subscribe(rotation_id)?;

        let rotation = self
            .get_rotation(rotation_id)
            .ok_or(VaultError::RotationNotFound(rotation_id))?;
        self.ctx.notifier.notify_progress(rotation_id, rotation.progress());

        subscription.forward(sink, cancel).await
    }

    /// Restart jobs for rows left `InProgress` without a running job
    pub fn resume_interrupted(&self) -> Vec<Uuid> {
        let pending: Vec<Uuid> = self
            .ctx
            .catalog
            .read(|state| state.in_progress_rotations().map(|r| r.id).collect());

        let mut resumed = Vec::new();
        for rotation_id in pending {
            let running = self
                .jobs
                .get(&rotation_id)
                .map_or(false, |handle| !handle.is_finished());
            if running {
                continue;
            }
            tracing::info!(%rotation_id, "Resuming interrupted rotation");
            self.spawn_job(rotation_id);
            resumed.push(rotation_id);
        }
        resumed
    }

    /// Wait for the background job of a rotation to exit
    pub async fn wait(&self, rotation_id: Uuid) -> VaultResult<()> {
        let Some((_, handle)) = self.jobs.remove(&rotation_id) else {
            return Ok(());
        };
        handle.await.map_err(|e| {
            VaultError::invalid_state(format!("rotation job {} aborted: {}", rotation_id, e))
        })
    }

    pub fn is_running(&self, rotation_id: Uuid) -> bool {
        self.jobs
            .get(&rotation_id)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop all jobs at their next batch boundary, leaving rows in progress
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();

        let ids: Vec<Uuid> = self.jobs.iter().map(|entry| *entry.key()).collect();
        for rotation_id in ids {
            if let Err(e) = self.wait(rotation_id).await {
                tracing::warn!(%rotation_id, error = %e, "Rotation job did not stop cleanly");
            }
        }
        tracing::info!("Rotation engine stopped");
    }

    fn spawn_job(&self, rotation_id: Uuid) {
        self.jobs.retain(|_, handle| !handle.is_finished());
        let handle = RotationJob::new(rotation_id, self.ctx.clone()).spawn();
        self.jobs.insert(rotation_id, handle);
    }
}

impl Drop for RotationEngine {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}
