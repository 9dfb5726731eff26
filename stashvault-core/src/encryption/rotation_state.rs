//! Key rotation state machine
//!
//! A rotation row starts `InProgress` and ends in exactly one of
//! `Completed`, `Failed` or `Cancelled`. Terminal rows never change again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::catalog::ImageSource;

/// Rotation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RotationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RotationStatus::InProgress)
    }
}

impl fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationStatus::InProgress => "InProgress",
            RotationStatus::Completed => "Completed",
            RotationStatus::Failed => "Failed",
            RotationStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl FromStr for RotationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "inprogress" => Ok(RotationStatus::InProgress),
            "completed" => Ok(RotationStatus::Completed),
            "failed" => Ok(RotationStatus::Failed),
            "cancelled" | "canceled" => Ok(RotationStatus::Cancelled),
            other => Err(format!("unknown rotation status: {}", other)),
        }
    }
}

/// Persistent record of one rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKeyRotation {
    pub id: Uuid,

    /// None in migration mode (encrypting never-encrypted images)
    pub from_key_id: Option<i64>,

    pub to_key_id: i64,

    pub status: RotationStatus,

    /// Size of the source population when the rotation started
    pub total_images: u64,

    pub processed_images: u64,

    pub failed_images: u64,

    pub batch_size: usize,

    pub initiated_by: String,

    pub is_automatic: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
}

impl EncryptionKeyRotation {
    pub fn is_migration(&self) -> bool {
        self.from_key_id.is_none()
    }

    /// Images this rotation draws from
    pub fn source(&self) -> ImageSource {
        match self.from_key_id {
            None => ImageSource::Unencrypted,
            Some(kid) => ImageSource::EncryptedWith(kid),
        }
    }

    pub fn progress(&self) -> RotationProgress {
        RotationProgress::from(self)
    }
}

/// Point-in-time view of a rotation, as published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationProgress {
    pub rotation_id: Uuid,
    pub status: RotationStatus,
    pub total_images: u64,
    pub processed_images: u64,
    pub failed_images: u64,
    pub percent_complete: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl RotationProgress {
    /// processed / total as a percentage, 0 for an empty population, never above 100
    pub fn percent(processed: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (processed as f64 / total as f64 * 100.0).min(100.0)
    }
}

impl From<&EncryptionKeyRotation> for RotationProgress {
    fn from(rotation: &EncryptionKeyRotation) -> Self {
        Self {
            rotation_id: rotation.id,
            status: rotation.status,
            total_images: rotation.total_images,
            processed_images: rotation.processed_images,
            failed_images: rotation.failed_images,
            percent_complete: Self::percent(rotation.processed_images, rotation.total_images),
            started_at: rotation.started_at,
            completed_at: rotation.completed_at,
            error_message: rotation.error_message.clone(),
        }
    }
}
