//! End-to-end tests over a fully wired vault
//!
//! Exercises key lifecycle, image encryption and persistence across
//! reopening an on-disk vault.

use std::sync::Arc;
use stashvault_core::{
    AuditEvent, Catalog, Clock, FileStorage, ImageOperation, KeyStatus, ManualClock, MemoryFileStorage,
    RotationConfig, RotationStatus, StartRotation, Vault, VaultConfig, VaultError,
};
use tempfile::TempDir;

// =========================================================================
// Test Helpers
// =========================================================================

struct TestEnvironment {
    _temp_dir: TempDir,
    config: VaultConfig,
}

impl TestEnvironment {
    fn new() -> Self {
        Self::with_rotation(RotationConfig::default())
    }

    fn with_rotation(rotation: RotationConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = VaultConfig::with_data_dir(temp_dir.path());
        config.rotation = rotation;

        Self {
            _temp_dir: temp_dir,
            config,
        }
    }

    async fn open(&self) -> Vault {
        Vault::open(self.config.clone()).await.unwrap()
    }
}

async fn memory_vault_with_clock(clock: Arc<ManualClock>) -> (Vault, Arc<MemoryFileStorage>) {
    let files = Arc::new(MemoryFileStorage::new());
    let vault = Vault::with_parts(VaultConfig::default(), Catalog::in_memory(), files.clone(), clock)
        .await
        .unwrap();
    (vault, files)
}

// =========================================================================
// Key lifecycle
// =========================================================================

#[tokio::test]
async fn test_key_lifecycle() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (vault, _files) = memory_vault_with_clock(clock.clone()).await;
    let keys = vault.keys();

    let k1 = keys.create_key("first", "alice").unwrap();
    assert_eq!(k1.version, 1);
    assert_eq!(k1.status, KeyStatus::Created);
    assert!(keys.get_active_key().is_none());

    clock.advance(chrono::Duration::minutes(5));
    assert!(keys.activate_key(k1.kid).unwrap());
    let active = keys.get_active_key().unwrap();
    assert_eq!(active.kid, k1.kid);
    assert_eq!(active.activated_at, Some(clock.now()));

    let k2 = keys.create_key("second", "alice").unwrap();
    assert_eq!(k2.version, 2);
    clock.advance(chrono::Duration::minutes(5));
    assert!(keys.activate_key(k2.kid).unwrap());

    let k1 = keys.get_key(k1.kid).unwrap();
    assert_eq!(k1.status, KeyStatus::Retired);
    assert_eq!(k1.retired_at, Some(clock.now()));
    assert_eq!(keys.get_active_key().unwrap().kid, k2.kid);

    let active_count = keys
        .list_keys()
        .iter()
        .filter(|k| k.status == KeyStatus::Active)
        .count();
    assert_eq!(active_count, 1);

    assert!(!keys.activate_key(999).unwrap());
    assert!(!keys.retire_key(999).unwrap());

    let err = keys.delete_key(k2.kid).unwrap_err();
    assert!(err.is_invalid_state());
    assert!(keys.delete_key(k1.kid).unwrap());
    assert!(keys.get_key(k1.kid).is_none());
}

#[tokio::test]
async fn test_no_active_key_blocks_encryption() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (vault, _files) = memory_vault_with_clock(clock).await;

    let mut data = b"picture".to_vec();
    let err = vault.images().encrypt(&mut data).unwrap_err();
    assert!(matches!(err, VaultError::NoActiveKey));

    let err = vault
        .rotations()
        .start_rotation(StartRotation::migration(1, "tester"))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::TargetKeyNotFound(1)));
}

#[tokio::test]
async fn test_retired_key_still_decrypts() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (vault, _files) = memory_vault_with_clock(clock).await;
    let keys = vault.keys();

    let k1 = keys.create_key("first", "alice").unwrap();
    keys.activate_key(k1.kid).unwrap();

    let mut data = b"drawer of cables".to_vec();
    let sealed = vault.images().encrypt(&mut data).unwrap();
    assert_eq!(sealed.key_id, k1.kid);
    assert!(data.iter().all(|b| *b == 0));

    let k2 = keys.create_key("second", "alice").unwrap();
    keys.activate_key(k2.kid).unwrap();
    keys.deprecate_key(k1.kid).unwrap();

    let plaintext = vault
        .images()
        .decrypt(&sealed.ciphertext, k1.kid, &sealed.iv, &sealed.tag)
        .unwrap();
    assert_eq!(plaintext.as_slice(), b"drawer of cables");

    let err = vault
        .images()
        .decrypt(&sealed.ciphertext, k2.kid, &sealed.iv, &sealed.tag)
        .unwrap_err();
    assert!(err.is_integrity());
}

#[tokio::test]
async fn test_audit_and_metrics_follow_operations() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (vault, _files) = memory_vault_with_clock(clock).await;

    let key = vault.keys().create_key("audited", "alice").unwrap();
    vault.keys().activate_key(key.kid).unwrap();
    vault
        .images()
        .register_image("box/1.png", b"png", None)
        .await
        .unwrap();

    let rotation = vault
        .rotations()
        .start_rotation(StartRotation::migration(key.kid, "alice"))
        .await
        .unwrap();
    vault.rotations().wait(rotation.id).await.unwrap();

    let events = vault.audit().get_events(10);
    assert!(matches!(
        events.first(),
        Some(AuditEvent::RotationFinished { rotation_id, .. }) if *rotation_id == rotation.id
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, AuditEvent::KeyCreated { kid, .. } if *kid == key.kid)));
    assert!(events
        .iter()
        .any(|e| matches!(e, AuditEvent::RotationStarted { total_images: 1, .. })));

    assert_eq!(vault.metrics().images_encrypted(), 1);
    assert_eq!(vault.metrics().failures(ImageOperation::Encrypt), 0);
    assert_eq!(vault.metrics().rotations_in_progress(), 0);
    assert!(vault
        .metrics()
        .gather_text()
        .unwrap()
        .contains("stashvault_images_encrypted_total"));
}

// =========================================================================
// On-disk vault
// =========================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let env = TestEnvironment::new();

    let (kid, image_id) = {
        let vault = env.open().await;
        let key = vault.keys().create_key("disk", "alice").unwrap();
        vault.keys().activate_key(key.kid).unwrap();
        let image = vault
            .images()
            .register_image("shelf/a.jpg", b"jpeg bytes", Some("image/jpeg".into()))
            .await
            .unwrap();
        let id = vault
            .rotations()
            .start_rotation(StartRotation::migration(key.kid, "alice"))
            .await
            .unwrap()
            .id;
        vault.rotations().wait(id).await.unwrap();
        vault.close().await;
        (key.kid, image.image_id)
    };

    let vault = env.open().await;
    assert_eq!(vault.keys().get_active_key().unwrap().kid, kid);

    let image = vault.images().get_image(image_id).unwrap();
    assert!(image.is_encrypted);
    assert_eq!(image.encryption_key_id, Some(kid));

    let on_disk = vault.images().storage().read_all_bytes("shelf/a.jpg").await.unwrap();
    assert_ne!(on_disk.as_slice(), b"jpeg bytes");

    let plaintext = vault.images().decrypt_image(&image).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"jpeg bytes");

    let rotations = vault.rotations().list_rotations(None);
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0].status, RotationStatus::Completed);
}

#[tokio::test]
async fn test_interrupted_rotation_resumes_on_open() {
    let env = TestEnvironment::with_rotation(RotationConfig {
        default_batch_size: 1,
        batch_delay_ms: 300,
        ..RotationConfig::default()
    });

    let rotation_id = {
        let vault = env.open().await;
        let key = vault.keys().create_key("disk", "alice").unwrap();
        vault.keys().activate_key(key.kid).unwrap();
        for i in 0..3 {
            vault
                .images()
                .register_image(&format!("bin/{}.jpg", i), b"bytes", None)
                .await
                .unwrap();
        }
        let rotation = vault
            .rotations()
            .start_rotation(StartRotation::migration(key.kid, "alice"))
            .await
            .unwrap();
        vault.close().await;

        let left = vault.rotations().get_rotation(rotation.id).unwrap();
        assert_eq!(left.status, RotationStatus::InProgress);
        rotation.id
    };

    let mut config = env.config.clone();
    config.rotation.batch_delay_ms = 0;
    let vault = Vault::open(config).await.unwrap();
    vault.rotations().wait(rotation_id).await.unwrap();

    let rotation = vault.rotations().get_rotation(rotation_id).unwrap();
    assert_eq!(rotation.status, RotationStatus::Completed);
    assert_eq!(rotation.total_images, 3);
    assert_eq!(rotation.processed_images, 3);
    assert!(vault.images().list_images().iter().all(|img| img.is_encrypted));
}

#[tokio::test]
async fn test_interrupted_rotation_stays_put_without_resume() {
    let env = TestEnvironment::with_rotation(RotationConfig {
        default_batch_size: 1,
        batch_delay_ms: 300,
        resume_on_startup: false,
        ..RotationConfig::default()
    });

    let rotation_id = {
        let vault = env.open().await;
        let key = vault.keys().create_key("disk", "alice").unwrap();
        vault.keys().activate_key(key.kid).unwrap();
        for i in 0..2 {
            vault
                .images()
                .register_image(&format!("bin/{}.jpg", i), b"bytes", None)
                .await
                .unwrap();
        }
        let rotation = vault
            .rotations()
            .start_rotation(StartRotation::migration(key.kid, "alice"))
            .await
            .unwrap();
        vault.close().await;
        rotation.id
    };

    let vault = env.open().await;
    assert!(!vault.rotations().is_running(rotation_id));
    assert_eq!(
        vault.rotations().get_rotation(rotation_id).unwrap().status,
        RotationStatus::InProgress
    );

    assert_eq!(vault.rotations().resume_interrupted(), vec![rotation_id]);
    assert!(vault.rotations().cancel_rotation(rotation_id).unwrap());
    vault.rotations().wait(rotation_id).await.unwrap();
    assert_eq!(
        vault.rotations().get_rotation(rotation_id).unwrap().status,
        RotationStatus::Cancelled
    );
}

#[tokio::test]
async fn test_closed_vault_refuses_new_rotations() {
    let env = TestEnvironment::new();
    let vault = env.open().await;
    let key = vault.keys().create_key("disk", "alice").unwrap();
    vault.keys().activate_key(key.kid).unwrap();

    vault.close().await;
    let err = vault
        .rotations()
        .start_rotation(StartRotation::migration(key.kid, "alice"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}
