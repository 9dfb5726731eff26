//! Encryption key lifecycle
//!
//! Keys move through `Created -> Active -> Retired`, with `Deprecated` as a
//! decrypt-only side state. Activation is a single catalog transaction, so
//! readers never see zero or two Active keys in the middle of a switch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::encryption::cipher::{KeyMaterial, ALGORITHM};
use crate::error::{VaultError, VaultResult};
use crate::monitoring::audit::{AuditEvent, AuditLogger};

/// Key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Generated but never used for encryption
    Created,
    /// The one key new material is sealed with
    Active,
    /// Kept for decrypting historical data only
    Deprecated,
    /// Replaced by a newer key; still decrypts
    Retired,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyStatus::Created => "Created",
            KeyStatus::Active => "Active",
            KeyStatus::Deprecated => "Deprecated",
            KeyStatus::Retired => "Retired",
        };
        f.write_str(name)
    }
}

/// Encryption key with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Catalog-assigned identifier
    pub kid: i64,

    /// Strictly increasing across all keys ever created
    pub version: u32,

    pub key_material: KeyMaterial,

    pub algorithm: String,

    pub status: KeyStatus,

    pub description: String,

    pub created_by: String,

    pub created_at: DateTime<Utc>,

    pub activated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,

    pub retired_at: Option<DateTime<Utc>>,
}

impl EncryptionKey {
    /// Whether decryption with this key should emit a diagnostic
    pub fn is_historical(&self) -> bool {
        matches!(self.status, KeyStatus::Deprecated | KeyStatus::Retired)
    }
}

/// Usage statistics for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStats {
    pub kid: i64,
    pub version: u32,
    pub status: KeyStatus,
    pub image_count: u64,
    pub total_bytes: u64,
}

/// Key store handling encryption key lifecycle
pub struct KeyStore {
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
}

impl KeyStore {
    pub fn new(catalog: Arc<Catalog>, clock: Arc<dyn Clock>, audit: Arc<AuditLogger>) -> Self {
        Self {
            catalog,
            clock,
            audit,
        }
    }

    /// Generate a new key in `Created` status with the next version
    pub fn create_key(&self, description: &str, created_by: &str) -> VaultResult<EncryptionKey> {
        let now = self.clock.now();
        let draft = EncryptionKey {
            kid: 0,
            version: 0,
            key_material: KeyMaterial::generate(),
            algorithm: ALGORITHM.to_string(),
            status: KeyStatus::Created,
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at: now,
            activated_at: None,
            deprecated_at: None,
            retired_at: None,
        };

        let key = self.catalog.transaction(|state| Ok(state.insert_key(draft)))?;

        tracing::info!(kid = key.kid, version = key.version, "Created encryption key");
        self.audit.log_event(AuditEvent::KeyCreated {
            kid: key.kid,
            version: key.version,
            created_by: key.created_by.clone(),
            timestamp: now,
        });

        Ok(key)
    }

    /// Retire every Active key and activate `kid`, atomically.
    ///
    /// Returns false if the key does not exist.
    pub fn activate_key(&self, kid: i64) -> VaultResult<bool> {
        let now = self.clock.now();

        let outcome = self.catalog.transaction(|state| {
            let Some(version) = state.key(kid).map(|k| k.version) else {
                return Ok(None);
            };

            let mut retired = Vec::new();
            for key in state.keys_mut() {
                if key.kid != kid && key.status == KeyStatus::Active {
                    key.status = KeyStatus::Retired;
                    key.retired_at = Some(now);
                    retired.push(key.kid);
                }
            }

            if let Some(target) = state.key_mut(kid) {
                if target.status != KeyStatus::Active {
                    target.status = KeyStatus::Active;
                    target.activated_at = Some(now);
                    target.retired_at = None;
                    target.deprecated_at = None;
                }
            }

            Ok(Some((version, retired)))
        })?;

        let Some((version, retired)) = outcome else {
            tracing::debug!(kid, "Activation requested for unknown key");
            return Ok(false);
        };

        tracing::info!(kid, version, retired = ?retired, "Activated encryption key");
        self.audit.log_event(AuditEvent::KeyActivated {
            kid,
            version,
            retired,
            timestamp: now,
        });

        Ok(true)
    }

    /// Mark a key Retired. Idempotent; false if the key does not exist.
    pub fn retire_key(&self, kid: i64) -> VaultResult<bool> {
        let now = self.clock.now();

        let changed = self.catalog.transaction(|state| {
            let Some(key) = state.key_mut(kid) else {
                return Ok(None);
            };
            if key.status == KeyStatus::Retired {
                return Ok(Some(false));
            }
            key.status = KeyStatus::Retired;
            key.retired_at = Some(now);
            Ok(Some(true))
        })?;

        match changed {
            None => Ok(false),
            Some(changed) => {
                if changed {
                    tracing::info!(kid, "Retired encryption key");
                    self.audit.log_event(AuditEvent::KeyRetired { kid, timestamp: now });
                }
                Ok(true)
            }
        }
    }

    /// Mark a key Deprecated (decrypt-only). Idempotent; false if absent.
    pub fn deprecate_key(&self, kid: i64) -> VaultResult<bool> {
        let now = self.clock.now();

        let changed = self.catalog.transaction(|state| {
            let Some(key) = state.key_mut(kid) else {
                return Ok(None);
            };
            if key.status == KeyStatus::Deprecated {
                return Ok(Some(false));
            }
            key.status = KeyStatus::Deprecated;
            key.deprecated_at = Some(now);
            Ok(Some(true))
        })?;

        match changed {
            None => Ok(false),
            Some(changed) => {
                if changed {
                    tracing::info!(kid, "Deprecated encryption key");
                    self.audit.log_event(AuditEvent::KeyDeprecated { kid, timestamp: now });
                }
                Ok(true)
            }
        }
    }

    /// Delete a key that nothing references any more.
    ///
    /// Refused while the key is Active, while any image is sealed with it,
    /// or while an in-progress rotation names it.
    pub fn delete_key(&self, kid: i64) -> VaultResult<bool> {
        let deleted = self.catalog.transaction(|state| {
            let Some(key) = state.key(kid) else {
                return Ok(false);
            };

            if key.status == KeyStatus::Active {
                return Err(VaultError::invalid_state(format!(
                    "encryption key {} is active and cannot be deleted",
                    kid
                )));
            }

            let referencing = state.images_referencing(kid).count();
            if referencing > 0 {
                return Err(VaultError::invalid_state(format!(
                    "encryption key {} is still used by {} images",
                    kid, referencing
                )));
            }

            if let Some(rotation) = state
                .in_progress_rotations()
                .find(|r| r.from_key_id == Some(kid) || r.to_key_id == kid)
            {
                return Err(VaultError::invalid_state(format!(
                    "encryption key {} is part of in-progress rotation {}",
                    kid, rotation.id
                )));
            }

            state.remove_key(kid);
            Ok(true)
        })?;

        if deleted {
            tracing::warn!(kid, "Deleted encryption key");
            self.audit.log_event(AuditEvent::KeyDeleted {
                kid,
                timestamp: self.clock.now(),
            });
        }

        Ok(deleted)
    }

    pub fn get_key(&self, kid: i64) -> Option<EncryptionKey> {
        self.catalog.read(|state| state.key(kid).cloned())
    }

    /// All keys in version order
    pub fn list_keys(&self) -> Vec<EncryptionKey> {
        let mut keys: Vec<EncryptionKey> = self.catalog.read(|state| state.keys().cloned().collect());
        keys.sort_by_key(|k| k.version);
        keys
    }

    /// Highest-version Active key, if any
    pub fn get_active_key(&self) -> Option<EncryptionKey> {
        self.catalog.read(|state| state.active_key().cloned())
    }

    pub fn get_key_stats(&self, kid: i64) -> VaultResult<KeyStats> {
        self.catalog.read(|state| {
            let key = state.key(kid).ok_or(VaultError::KeyNotFound(kid))?;
            let (image_count, total_bytes) = state
                .images_referencing(kid)
                .fold((0u64, 0u64), |(count, bytes), img| {
                    (count + 1, bytes + img.size_in_bytes)
                });

            Ok(KeyStats {
                kid,
                version: key.version,
                status: key.status,
                image_count,
                total_bytes,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ImageMetadata;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> (KeyStore, Arc<Catalog>, Arc<ManualClock>, Arc<AuditLogger>) {
        let catalog = Arc::new(Catalog::in_memory());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let audit = Arc::new(AuditLogger::new(true, 100));
        let store = KeyStore::new(catalog.clone(), clock.clone(), audit.clone());
        (store, catalog, clock, audit)
    }

    fn sealed_image(kid: i64, size: u64) -> ImageMetadata {
        ImageMetadata {
            image_id: 0,
            storage_path: format!("img-{}.jpg", size),
            content_type: None,
            is_encrypted: true,
            encryption_key_id: Some(kid),
            initialization_vector: Some([1; 12]),
            authentication_tag: Some([2; 16]),
            size_in_bytes: size,
            uploaded_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_key_lifecycle() {
        let (store, _, _, _) = store();

        let k1 = store.create_key("K1", "admin").unwrap();
        assert_eq!(k1.version, 1);
        assert_eq!(k1.status, KeyStatus::Created);
        assert_eq!(k1.algorithm, "AES-256-GCM");

        assert!(store.activate_key(k1.kid).unwrap());
        assert_eq!(store.get_key(k1.kid).unwrap().status, KeyStatus::Active);

        let k2 = store.create_key("K2", "admin").unwrap();
        assert_eq!(k2.version, 2);

        assert!(store.activate_key(k2.kid).unwrap());
        let k1 = store.get_key(k1.kid).unwrap();
        assert_eq!(k1.status, KeyStatus::Retired);
        assert!(k1.retired_at.is_some());
        assert_eq!(store.get_key(k2.kid).unwrap().status, KeyStatus::Active);
        assert_eq!(store.get_active_key().unwrap().kid, k2.kid);
    }

    #[test]
    fn test_racing_activations_always_show_exactly_one_active_key() {
        let (store, _, _, _) = store();
        let kids: Vec<i64> = (0..8)
            .map(|i| store.create_key(&format!("K{}", i), "admin").unwrap().kid)
            .collect();
        store.activate_key(kids[0]).unwrap();
        let done = AtomicBool::new(false);

        let observed = std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut observed = Vec::new();
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let active = store
                        .list_keys()
                        .iter()
                        .filter(|k| k.status == KeyStatus::Active)
                        .count();
                    observed.push(active);
                    if finished {
                        return observed;
                    }
                }
            });

            let writers: Vec<_> = kids
                .chunks(2)
                .map(|pair| {
                    let store = &store;
                    scope.spawn(move || {
                        for _ in 0..50 {
                            for kid in pair {
                                assert!(store.activate_key(*kid).unwrap());
                            }
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, Ordering::Release);
            reader.join().unwrap()
        });

        assert!(
            observed.iter().all(|&count| count == 1),
            "saw {:?} active keys",
            observed.iter().filter(|&&count| count != 1).collect::<Vec<_>>()
        );

        let active: Vec<i64> = store
            .list_keys()
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .map(|k| k.kid)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(store.get_active_key().unwrap().kid, active[0]);
    }

    #[test]
    fn test_activate_unknown_key_returns_false() {
        let (store, _, _, _) = store();
        let k1 = store.create_key("K1", "admin").unwrap();
        store.activate_key(k1.kid).unwrap();

        assert!(!store.activate_key(42).unwrap());
        assert_eq!(store.get_active_key().unwrap().kid, k1.kid);
    }

    #[test]
    fn test_activation_uses_clock() {
        let (store, _, clock, _) = store();
        let key = store.create_key("K", "admin").unwrap();
        clock.advance(Duration::minutes(5));
        store.activate_key(key.kid).unwrap();

        let key_after = store.get_key(key.kid).unwrap();
        assert_eq!(key_after.activated_at, Some(clock.now()));
        assert_eq!(key_after.created_at + Duration::minutes(5), clock.now());
    }

    #[test]
    fn test_versions_never_reused_after_delete() {
        let (store, _, _, _) = store();
        let k1 = store.create_key("K1", "admin").unwrap();
        let k2 = store.create_key("K2", "admin").unwrap();
        assert!(store.delete_key(k2.kid).unwrap());

        let k3 = store.create_key("K3", "admin").unwrap();
        assert!(k3.version > k2.version);
        assert!(k3.kid > k1.kid);
    }

    #[test]
    fn test_retire_is_idempotent() {
        let (store, _, _, audit) = store();
        let key = store.create_key("K", "admin").unwrap();
        store.activate_key(key.kid).unwrap();

        assert!(store.retire_key(key.kid).unwrap());
        assert!(store.retire_key(key.kid).unwrap());
        assert!(!store.retire_key(999).unwrap());
        assert!(store.get_active_key().is_none());

        let retirements = audit
            .get_events(100)
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::KeyRetired { .. }))
            .count();
        assert_eq!(retirements, 1);
    }

    #[test]
    fn test_deprecate_key() {
        let (store, _, _, _) = store();
        let key = store.create_key("K", "admin").unwrap();

        assert!(store.deprecate_key(key.kid).unwrap());
        let key = store.get_key(key.kid).unwrap();
        assert_eq!(key.status, KeyStatus::Deprecated);
        assert!(key.deprecated_at.is_some());
        assert!(key.is_historical());
        assert!(!store.deprecate_key(77).unwrap());
    }

    #[test]
    fn test_delete_is_restricted_while_in_use() {
        let (store, catalog, _, _) = store();
        let k1 = store.create_key("K1", "admin").unwrap();
        store.activate_key(k1.kid).unwrap();

        let err = store.delete_key(k1.kid).unwrap_err();
        assert!(err.is_invalid_state());

        let k2 = store.create_key("K2", "admin").unwrap();
        store.activate_key(k2.kid).unwrap();
        catalog
            .transaction(|s| Ok(s.insert_image(sealed_image(k1.kid, 10))))
            .unwrap();

        let err = store.delete_key(k1.kid).unwrap_err();
        assert!(err.to_string().contains("still used by 1 images"));
        assert!(store.get_key(k1.kid).is_some());
        assert!(!store.delete_key(12345).unwrap());
    }

    #[test]
    fn test_key_stats() {
        let (store, catalog, _, _) = store();
        let key = store.create_key("K", "admin").unwrap();
        catalog
            .transaction(|s| {
                s.insert_image(sealed_image(key.kid, 100));
                s.insert_image(sealed_image(key.kid, 250));
                Ok(())
            })
            .unwrap();

        let stats = store.get_key_stats(key.kid).unwrap();
        assert_eq!(stats.image_count, 2);
        assert_eq!(stats.total_bytes, 350);
        assert_eq!(stats.version, 1);

        let err = store.get_key_stats(999).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_keys_in_version_order() {
        let (store, _, _, _) = store();
        for name in ["a", "b", "c"] {
            store.create_key(name, "admin").unwrap();
        }
        let versions: Vec<u32> = store.list_keys().iter().map(|k| k.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_key_material_not_in_debug_output() {
        let (store, _, _, _) = store();
        let key = store.create_key("K", "admin").unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(key.key_material.as_bytes())));
    }
}
