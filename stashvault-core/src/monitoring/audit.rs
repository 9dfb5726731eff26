//! Audit trail for key lifecycle and rotation events

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::encryption::rotation_state::RotationStatus;

/// Audit event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    KeyCreated {
        kid: i64,
        version: u32,
        created_by: String,
        timestamp: DateTime<Utc>,
    },
    KeyActivated {
        kid: i64,
        version: u32,
        retired: Vec<i64>,
        timestamp: DateTime<Utc>,
    },
    KeyRetired {
        kid: i64,
        timestamp: DateTime<Utc>,
    },
    KeyDeprecated {
        kid: i64,
        timestamp: DateTime<Utc>,
    },
    KeyDeleted {
        kid: i64,
        timestamp: DateTime<Utc>,
    },
    RotationStarted {
        rotation_id: Uuid,
        from_key_id: Option<i64>,
        to_key_id: i64,
        total_images: u64,
        initiated_by: String,
        is_automatic: bool,
        timestamp: DateTime<Utc>,
    },
    RotationCancelled {
        rotation_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    RotationFinished {
        rotation_id: Uuid,
        status: RotationStatus,
        processed_images: u64,
        failed_images: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Audit logger
#[derive(Debug)]
pub struct AuditLogger {
    enabled: bool,
    retention: usize,
    events: RwLock<VecDeque<AuditEvent>>,
}

impl AuditLogger {
    pub fn new(enabled: bool, retention: usize) -> Self {
        Self {
            enabled,
            retention,
            events: RwLock::new(VecDeque::new()),
        }
    }

    /// Logger that drops everything
    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn log_event(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }

        match &event {
            AuditEvent::KeyCreated { kid, version, created_by, .. } => {
                tracing::info!(
                    target: "audit",
                    event_type = "key_created",
                    kid = *kid,
                    version = *version,
                    created_by = %created_by,
                    "Encryption key created"
                );
            }
            AuditEvent::KeyActivated { kid, version, retired, .. } => {
                tracing::info!(
                    target: "audit",
                    event_type = "key_activated",
                    kid = *kid,
                    version = *version,
                    retired = ?retired,
                    "Encryption key activated"
                );
            }
            AuditEvent::KeyRetired { kid, .. } => {
                tracing::info!(target: "audit", event_type = "key_retired", kid = *kid, "Encryption key retired");
            }
            AuditEvent::KeyDeprecated { kid, .. } => {
                tracing::info!(target: "audit", event_type = "key_deprecated", kid = *kid, "Encryption key deprecated");
            }
            AuditEvent::KeyDeleted { kid, .. } => {
                tracing::warn!(target: "audit", event_type = "key_deleted", kid = *kid, "Encryption key deleted");
            }
            AuditEvent::RotationStarted {
                rotation_id,
                from_key_id,
                to_key_id,
                total_images,
                initiated_by,
                is_automatic,
                ..
            } => {
                tracing::info!(
                    target: "audit",
                    event_type = "rotation_started",
                    rotation_id = %rotation_id,
                    from_key_id = ?from_key_id,
                    to_key_id = *to_key_id,
                    total_images = *total_images,
                    initiated_by = %initiated_by,
                    is_automatic = *is_automatic,
                    "Key rotation started"
                );
            }
            AuditEvent::RotationCancelled { rotation_id, .. } => {
                tracing::warn!(
                    target: "audit",
                    event_type = "rotation_cancelled",
                    rotation_id = %rotation_id,
                    "Key rotation cancelled"
                );
            }
            AuditEvent::RotationFinished {
                rotation_id,
                status,
                processed_images,
                failed_images,
                ..
            } => {
                tracing::info!(
                    target: "audit",
                    event_type = "rotation_finished",
                    rotation_id = %rotation_id,
                    status = ?status,
                    processed_images = *processed_images,
                    failed_images = *failed_images,
                    "Key rotation finished"
                );
            }
        }

        let mut events = self.events.write();
        events.push_back(event);
        while events.len() > self.retention {
            events.pop_front();
        }
    }

    /// Most recent events first
    pub fn get_events(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
