//! Whole-image encryption on top of the key store, cipher and file storage
//!
//! New material is always sealed with the current Active key. Historical
//! keys (Deprecated or Retired) still decrypt, with a warning.

use std::sync::Arc;
use std::time::Instant;
use zeroize::Zeroizing;

use crate::catalog::{Catalog, ImageMetadata};
use crate::clock::Clock;
use crate::encryption::cipher::{ImageCipher, WipeOnDrop, NONCE_LENGTH, TAG_LENGTH};
use crate::encryption::key_store::KeyStore;
use crate::error::{VaultError, VaultResult};
use crate::monitoring::metrics::{ImageOperation, VaultMetrics};
use crate::storage::FileStorage;

/// Output of sealing a buffer under the Active key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResult {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LENGTH],
    pub tag: [u8; TAG_LENGTH],
    pub key_id: i64,
}

/// Image encryption service
pub struct ImageEncryptionService {
    keys: Arc<KeyStore>,
    catalog: Arc<Catalog>,
    storage: Arc<dyn FileStorage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<VaultMetrics>,
    cipher: ImageCipher,
}

impl ImageEncryptionService {
    pub fn new(
        keys: Arc<KeyStore>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn FileStorage>,
        clock: Arc<dyn Clock>,
        metrics: Arc<VaultMetrics>,
    ) -> Self {
        Self {
            keys,
            catalog,
            storage,
            clock,
            metrics,
            cipher: ImageCipher::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }

    /// Seal `input` with the Active key.
    ///
    /// `input` is zeroed before this returns on every path, including the
    /// no-active-key error.
    pub fn encrypt(&self, input: &mut [u8]) -> VaultResult<EncryptionResult> {
        let input = WipeOnDrop(input);
        let started = Instant::now();

        let key = self.keys.get_active_key().ok_or(VaultError::NoActiveKey)?;
        let sealed = self
            .cipher
            .encrypt(&key.key_material, &mut *input.0)
            .map_err(|e| {
                self.metrics.record_failure(ImageOperation::Encrypt);
                VaultError::from(e)
            })?;

        self.metrics.record_success(ImageOperation::Encrypt, started.elapsed());

        Ok(EncryptionResult {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            tag: sealed.tag,
            key_id: key.kid,
        })
    }

    /// Decrypt a payload sealed with key `kid`
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        kid: i64,
        iv: &[u8; NONCE_LENGTH],
        tag: &[u8; TAG_LENGTH],
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        let started = Instant::now();
        let key = self.keys.get_key(kid).ok_or(VaultError::KeyNotFound(kid))?;

        if key.is_historical() {
            tracing::warn!(
                kid,
                status = %key.status,
                "Decrypting with a key that is no longer active"
            );
        }

        match self.cipher.decrypt(&key.key_material, ciphertext, iv, tag) {
            Ok(plaintext) => {
                self.metrics.record_success(ImageOperation::Decrypt, started.elapsed());
                Ok(plaintext)
            }
            Err(source) => {
                self.metrics.record_failure(ImageOperation::Decrypt);
                tracing::error!(kid, error = %source, "Image decryption failed");
                Err(VaultError::Decryption { kid, source })
            }
        }
    }

    /// Read and decrypt the stored bytes of an encrypted image
    pub async fn decrypt_image(&self, image: &ImageMetadata) -> VaultResult<Zeroizing<Vec<u8>>> {
        if !image.is_encrypted {
            return Err(VaultError::invalid_state(format!(
                "image {} is not encrypted",
                image.image_id
            )));
        }

        let (kid, iv, tag) = image.crypto_fields().ok_or_else(|| {
            VaultError::invalid_state(format!(
                "image {} is missing encryption metadata",
                image.image_id
            ))
        })?;

        if !self.storage.exists(&image.storage_path).await? {
            return Err(VaultError::FileNotFound(image.storage_path.clone()));
        }

        let ciphertext = self.storage.read_all_bytes(&image.storage_path).await?;
        self.decrypt(&ciphertext, kid, &iv, &tag)
    }

    /// Plaintext of any image, encrypted or not
    pub async fn read_image(&self, image: &ImageMetadata) -> VaultResult<Zeroizing<Vec<u8>>> {
        if image.is_encrypted {
            self.decrypt_image(image).await
        } else {
            let bytes = self.storage.read_all_bytes(&image.storage_path).await?;
            Ok(Zeroizing::new(bytes))
        }
    }

    /// Encrypt a never-encrypted image in place with key `kid`
    pub async fn encrypt_existing_image(
        &self,
        image: &ImageMetadata,
        kid: i64,
    ) -> VaultResult<ImageMetadata> {
        if image.is_encrypted {
            return Err(VaultError::invalid_state(format!(
                "image {} is already encrypted; re-encrypt it instead",
                image.image_id
            )));
        }

        let started = Instant::now();
        let mut plaintext = Zeroizing::new(self.storage.read_all_bytes(&image.storage_path).await?);
        let key = self.keys.get_key(kid).ok_or(VaultError::KeyNotFound(kid))?;

        let sealed = self.cipher.encrypt(&key.key_material, plaintext.as_mut_slice())?;
        drop(plaintext);

        self.storage
            .write_all_bytes(&image.storage_path, &sealed.ciphertext)
            .await?;

        let mut updated = image.clone();
        updated.is_encrypted = true;
        updated.encryption_key_id = Some(kid);
        updated.initialization_vector = Some(sealed.iv);
        updated.authentication_tag = Some(sealed.tag);
        updated.updated_at = self.clock.now();
        self.commit(&updated).await?;

        self.metrics.record_success(ImageOperation::Encrypt, started.elapsed());
        tracing::debug!(image_id = image.image_id, kid, "Encrypted image");
        Ok(updated)
    }

    /// Move an encrypted image onto the Active key.
    ///
    /// `new_kid` must name a known key; the key actually used is whichever
    /// is Active when the call runs, and that is what the metadata records.
    pub async fn re_encrypt_image(
        &self,
        image: &ImageMetadata,
        new_kid: i64,
    ) -> VaultResult<ImageMetadata> {
        let started = Instant::now();
        let mut plaintext = self.decrypt_image(image).await?;

        if self.keys.get_key(new_kid).is_none() {
            return Err(VaultError::KeyNotFound(new_kid));
        }

        let result = self.encrypt(plaintext.as_mut_slice())?;
        drop(plaintext);

        if result.key_id != new_kid {
            tracing::warn!(
                image_id = image.image_id,
                requested = new_kid,
                used = result.key_id,
                "Re-encrypted with the active key rather than the requested key"
            );
        }

        self.storage
            .write_all_bytes(&image.storage_path, &result.ciphertext)
            .await?;

        let mut updated = image.clone();
        updated.encryption_key_id = Some(result.key_id);
        updated.initialization_vector = Some(result.iv);
        updated.authentication_tag = Some(result.tag);
        updated.updated_at = self.clock.now();
        self.commit(&updated).await?;

        self.metrics.record_success(ImageOperation::ReEncrypt, started.elapsed());
        tracing::debug!(
            image_id = image.image_id,
            from = ?image.encryption_key_id,
            to = result.key_id,
            "Re-encrypted image"
        );
        Ok(updated)
    }

    /// Store an upload unencrypted and catalog it.
    ///
    /// Fails with `InvalidState` when `storage_path` already holds a file or
    /// belongs to a cataloged image; existing bytes are never overwritten.
    pub async fn register_image(
        &self,
        storage_path: &str,
        bytes: &[u8],
        content_type: Option<String>,
    ) -> VaultResult<ImageMetadata> {
        let owner = self
            .catalog
            .read(|state| state.image_at(storage_path).map(|image| image.image_id));
        if let Some(owner) = owner {
            return Err(VaultError::invalid_state(format!(
                "storage path {} is already used by image {}",
                storage_path, owner
            )));
        }
        if self.storage.exists(storage_path).await? {
            return Err(VaultError::invalid_state(format!(
                "storage path {} already holds a file",
                storage_path
            )));
        }

        self.storage.write_all_bytes(storage_path, bytes).await?;

        let now = self.clock.now();
        let draft = ImageMetadata {
            image_id: 0,
            storage_path: storage_path.to_string(),
            content_type,
            is_encrypted: false,
            encryption_key_id: None,
            initialization_vector: None,
            authentication_tag: None,
            size_in_bytes: bytes.len() as u64,
            uploaded_at: now,
            updated_at: now,
        };

        let image = self
            .catalog
            .spawn_transaction(move |state| {
                // Another upload claimed the path after the checks above
                if let Some(owner) = state.image_at(&draft.storage_path) {
                    return Err(VaultError::invalid_state(format!(
                        "storage path {} is already used by image {}",
                        draft.storage_path, owner.image_id
                    )));
                }
                Ok(state.insert_image(draft))
            })
            .await?;
        tracing::info!(image_id = image.image_id, path = storage_path, "Registered image");
        Ok(image)
    }

    pub fn get_image(&self, image_id: i64) -> Option<ImageMetadata> {
        self.catalog.read(|state| state.image(image_id).cloned())
    }

    pub fn list_images(&self) -> Vec<ImageMetadata> {
        self.catalog.read(|state| state.images().cloned().collect())
    }

    async fn commit(&self, image: &ImageMetadata) -> VaultResult<()> {
        let image = image.clone();
        self.catalog
            .spawn_transaction(move |state| {
                let image_id = image.image_id;
                if state.replace_image(image) {
                    Ok(())
                } else {
                    Err(VaultError::ImageNotFound(image_id))
                }
            })
            .await
    }
}
