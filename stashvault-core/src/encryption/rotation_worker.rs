//! Background batch job for one rotation
//!
//! The job re-reads the rotation row before every batch, so a cancel
//! request takes effect at the next batch boundary. Each batch commits its
//! counters in its own short transaction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogState, ImageMetadata};
use crate::clock::Clock;
use crate::encryption::image_encryption::ImageEncryptionService;
use crate::encryption::progress::ProgressNotifier;
use crate::encryption::rotation_state::{EncryptionKeyRotation, RotationStatus};
use crate::error::{VaultError, VaultResult};
use crate::monitoring::audit::{AuditEvent, AuditLogger};
use crate::monitoring::metrics::{ImageOperation, VaultMetrics};

/// Everything a rotation job needs, owned so it can run detached
#[derive(Clone)]
pub(crate) struct JobContext {
    pub catalog: Arc<Catalog>,
    pub images: Arc<ImageEncryptionService>,
    pub notifier: ProgressNotifier,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<AuditLogger>,
    pub metrics: Arc<VaultMetrics>,
    pub shutdown: CancellationToken,
    pub batch_delay: Duration,
}

/// How the batch loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Source population exhausted
    Drained,
    /// Row left InProgress by someone else (cancelled)
    Stopped(RotationStatus),
    /// Engine shutdown; the row stays InProgress for resumption
    Interrupted,
}

pub(crate) struct RotationJob {
    rotation_id: Uuid,
    ctx: JobContext,
    /// Images this job already tried, successful or not
    attempted: HashSet<i64>,
}

impl RotationJob {
    pub fn new(rotation_id: Uuid, ctx: JobContext) -> Self {
        Self {
            rotation_id,
            ctx,
            attempted: HashSet::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let rotation_id = self.rotation_id;
        self.ctx.metrics.job_started();
        tracing::info!(%rotation_id, "Rotation job started");

        let outcome = self.process().await;
        match outcome {
            Ok(LoopExit::Drained) => {
                if let Err(e) = self.finalize().await {
                    self.record_fatal(e).await;
                }
            }
            Ok(LoopExit::Stopped(status)) => {
                tracing::info!(%rotation_id, %status, "Rotation job stopped");
            }
            Ok(LoopExit::Interrupted) => {
                tracing::info!(%rotation_id, "Rotation job interrupted by shutdown; left in progress");
            }
            Err(e) => self.record_fatal(e).await,
        }

        self.ctx.metrics.job_stopped();
    }

    async fn process(&mut self) -> VaultResult<LoopExit> {
        loop {
            if self.ctx.shutdown.is_cancelled() {
                return Ok(LoopExit::Interrupted);
            }

            let rotation = self.load()?;
            if rotation.status != RotationStatus::InProgress {
                return Ok(LoopExit::Stopped(rotation.status));
            }

            let batch_size = rotation.batch_size.max(1);
            let batch = self.ctx.catalog.read(|state| {
                state.fetch_source(rotation.source(), &self.attempted, batch_size)
            });

            let (processed, failed) = self.process_batch(&rotation, &batch).await;
            self.commit_counters(processed, failed).await?;

            tracing::debug!(
                rotation_id = %self.rotation_id,
                batch = batch.len(),
                processed,
                failed,
                "Rotation batch done"
            );

            if batch.len() < batch_size {
                return Ok(LoopExit::Drained);
            }

            if !self.ctx.batch_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = self.ctx.shutdown.cancelled() => return Ok(LoopExit::Interrupted),
                    () = tokio::time::sleep(self.ctx.batch_delay) => {}
                }
            }
        }
    }

    async fn process_batch(
        &mut self,
        rotation: &EncryptionKeyRotation,
        batch: &[ImageMetadata],
    ) -> (u64, u64) {
        let mut processed = 0u64;
        let mut failed = 0u64;

        for image in batch {
            self.attempted.insert(image.image_id);

            let (op, result) = if rotation.is_migration() {
                (
                    ImageOperation::Encrypt,
                    self.ctx
                        .images
                        .encrypt_existing_image(image, rotation.to_key_id)
                        .await,
                )
            } else {
                (
                    ImageOperation::ReEncrypt,
                    self.ctx
                        .images
                        .re_encrypt_image(image, rotation.to_key_id)
                        .await,
                )
            };

            match result {
                Ok(_) => processed += 1,
                Err(e) => {
                    failed += 1;
                    self.ctx.metrics.record_failure(op);
                    tracing::warn!(
                        rotation_id = %self.rotation_id,
                        image_id = image.image_id,
                        error = %e,
                        "Image failed during rotation"
                    );
                }
            }
        }

        (processed, failed)
    }

    fn load(&self) -> VaultResult<EncryptionKeyRotation> {
        let rotation_id = self.rotation_id;
        self.ctx
            .catalog
            .read(|state| state.rotation(rotation_id).cloned())
            .ok_or(VaultError::RotationNotFound(rotation_id))
    }

    /// Add a batch's counters and publish, unless the row already went terminal
    async fn commit_counters(&self, processed: u64, failed: u64) -> VaultResult<()> {
        let rotation_id = self.rotation_id;
        let snapshot = self
            .ctx
            .catalog
            .spawn_transaction(move |state| {
                let rotation = state
                    .rotation_mut(rotation_id)
                    .ok_or(VaultError::RotationNotFound(rotation_id))?;
                if rotation.status != RotationStatus::InProgress {
                    return Ok(None);
                }
                rotation.processed_images += processed;
                rotation.failed_images += failed;
                Ok(Some(rotation.progress()))
            })
            .await?;

        if let Some(snapshot) = snapshot {
            self.ctx.notifier.notify_progress(rotation_id, snapshot);
        }
        Ok(())
    }

    async fn finalize(&self) -> VaultResult<()> {
        let rotation_id = self.rotation_id;
        let now = self.ctx.clock.now();

        let finished = self
            .ctx
            .catalog
            .spawn_transaction(move |state| {
                let rotation = state
                    .rotation_mut(rotation_id)
                    .ok_or(VaultError::RotationNotFound(rotation_id))?;
                if rotation.status != RotationStatus::InProgress {
                    return Ok(None);
                }

                if rotation.failed_images > 0 {
                    rotation.status = RotationStatus::Failed;
                    rotation.error_message = Some(format!(
                        "{} of {} images failed",
                        rotation.failed_images,
                        rotation.failed_images + rotation.processed_images
                    ));
                } else {
                    rotation.status = RotationStatus::Completed;
                }
                rotation.completed_at = Some(now);
                Ok(Some(rotation.clone()))
            })
            .await?;

        if let Some(rotation) = finished {
            self.announce(&rotation);
        }
        Ok(())
    }

    /// Mark the rotation Failed with the error that escaped the loop.
    ///
    /// When the catalog cannot persist the mark, it is applied in memory
    /// only: observers still see the failure, and a reopened catalog finds
    /// the row in progress and resumes it.
    async fn record_fatal(&self, error: VaultError) {
        let rotation_id = self.rotation_id;
        let message = error.to_string();
        let now = self.ctx.clock.now();
        tracing::error!(%rotation_id, error = %message, "Rotation job failed");

        let mark = move |state: &mut CatalogState| {
            let rotation = state.rotation_mut(rotation_id)?;
            if rotation.status != RotationStatus::InProgress {
                return None;
            }
            rotation.status = RotationStatus::Failed;
            rotation.error_message = Some(message);
            rotation.completed_at = Some(now);
            Some(rotation.clone())
        };

        let logged = mark.clone();
        let persisted = self
            .ctx
            .catalog
            .spawn_transaction(move |state| Ok(logged(state)))
            .await;

        let failed = match persisted {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!(
                    %rotation_id,
                    error = %e,
                    "Could not persist rotation failure; marking it in memory only"
                );
                self.ctx.catalog.update_unlogged(mark)
            }
        };

        if let Some(rotation) = failed {
            self.announce(&rotation);
        }
    }

    fn announce(&self, rotation: &EncryptionKeyRotation) {
        self.ctx
            .notifier
            .notify_progress(rotation.id, rotation.progress());
        self.ctx.metrics.rotation_finished(rotation.status);
        self.ctx.audit.log_event(AuditEvent::RotationFinished {
            rotation_id: rotation.id,
            status: rotation.status,
            processed_images: rotation.processed_images,
            failed_images: rotation.failed_images,
            timestamp: self.ctx.clock.now(),
        });
        tracing::info!(
            rotation_id = %rotation.id,
            status = %rotation.status,
            processed = rotation.processed_images,
            failed = rotation.failed_images,
            total = rotation.total_images,
            "Rotation finished"
        );
    }
}
