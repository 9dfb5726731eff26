//! Prometheus metrics for image encryption and key rotation

use anyhow::Result;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramOpts,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::encryption::rotation_state::RotationStatus;

/// Image operation names used as metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOperation {
    Encrypt,
    Decrypt,
    ReEncrypt,
}

impl ImageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageOperation::Encrypt => "encrypt",
            ImageOperation::Decrypt => "decrypt",
            ImageOperation::ReEncrypt => "re_encrypt",
        }
    }
}

/// Metric handles shared by the image service and rotation engine
#[derive(Clone)]
pub struct VaultMetrics {
    registry: Registry,
    images_encrypted: IntCounter,
    images_decrypted: IntCounter,
    image_failures: IntCounterVec,
    image_latency: HistogramVec,
    rotations_started: IntCounter,
    rotations_finished: IntCounterVec,
    rotations_in_progress: IntGauge,
}

impl VaultMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let images_encrypted = register_int_counter_with_registry!(
            Opts::new("stashvault_images_encrypted_total", "Images sealed under a key"),
            registry
        )?;

        let images_decrypted = register_int_counter_with_registry!(
            Opts::new("stashvault_images_decrypted_total", "Image payloads successfully decrypted"),
            registry
        )?;

        let image_failures = register_int_counter_vec_with_registry!(
            Opts::new("stashvault_image_failures_total", "Failed image crypto operations"),
            &["operation"],
            registry
        )?;

        let image_latency = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "stashvault_image_operation_seconds",
                "Latency of whole-image crypto operations"
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
            registry
        )?;

        let rotations_started = register_int_counter_with_registry!(
            Opts::new("stashvault_rotations_started_total", "Key rotations started"),
            registry
        )?;

        let rotations_finished = register_int_counter_vec_with_registry!(
            Opts::new("stashvault_rotations_finished_total", "Key rotations reaching a terminal state"),
            &["status"],
            registry
        )?;

        let rotations_in_progress = register_int_gauge_with_registry!(
            Opts::new("stashvault_rotations_in_progress", "Rotation jobs currently running"),
            registry
        )?;

        Ok(Self {
            registry,
            images_encrypted,
            images_decrypted,
            image_failures,
            image_latency,
            rotations_started,
            rotations_finished,
            rotations_in_progress,
        })
    }

    pub fn record_success(&self, op: ImageOperation, elapsed: Duration) {
        // re-encryption already counted through its inner encrypt
        match op {
            ImageOperation::Encrypt => self.images_encrypted.inc(),
            ImageOperation::Decrypt => self.images_decrypted.inc(),
            ImageOperation::ReEncrypt => {}
        }
        self.image_latency
            .with_label_values(&[op.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, op: ImageOperation) {
        self.image_failures.with_label_values(&[op.as_str()]).inc();
    }

    pub fn rotation_started(&self) {
        self.rotations_started.inc();
    }

    /// A rotation job began running (fresh or resumed)
    pub fn job_started(&self) {
        self.rotations_in_progress.inc();
    }

    pub fn job_stopped(&self) {
        self.rotations_in_progress.dec();
    }

    pub fn rotation_finished(&self, status: RotationStatus) {
        let status = status.to_string();
        self.rotations_finished
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn images_encrypted(&self) -> u64 {
        self.images_encrypted.get()
    }

    pub fn images_decrypted(&self) -> u64 {
        self.images_decrypted.get()
    }

    pub fn failures(&self, op: ImageOperation) -> u64 {
        self.image_failures.with_label_values(&[op.as_str()]).get()
    }

    pub fn rotations_in_progress(&self) -> i64 {
        self.rotations_in_progress.get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut output = Vec::new();
        encoder.encode(&metric_families, &mut output)?;
        Ok(String::from_utf8(output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.record_success(ImageOperation::Encrypt, Duration::from_millis(3));
        metrics.record_success(ImageOperation::ReEncrypt, Duration::from_millis(3));
        metrics.record_success(ImageOperation::Decrypt, Duration::from_millis(1));
        metrics.record_failure(ImageOperation::Decrypt);

        assert_eq!(metrics.images_encrypted(), 1);
        assert_eq!(metrics.images_decrypted(), 1);
        assert_eq!(metrics.failures(ImageOperation::Decrypt), 1);
        assert_eq!(metrics.failures(ImageOperation::Encrypt), 0);
    }

    #[test]
    fn test_in_progress_gauge() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.job_started();
        metrics.job_started();
        metrics.job_stopped();
        assert_eq!(metrics.rotations_in_progress(), 1);
    }

    #[test]
    fn test_gather_text() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.rotation_started();
        metrics.rotation_finished(RotationStatus::Completed);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("stashvault_rotations_started_total 1"));
        assert!(text.contains("stashvault_rotations_finished_total{status=\"Completed\"} 1"));
    }
}
