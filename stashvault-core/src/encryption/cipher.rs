//! Image payload encryption using AES-256-GCM with detached tags
//!
//! Every buffer that holds plaintext is wiped on both the success and the
//! failure path, including unwinding.

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce, Tag,
};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Algorithm identifier recorded on every key
pub const ALGORITHM: &str = "AES-256-GCM";

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;

/// GCM nonce length in bytes
pub const NONCE_LENGTH: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_LENGTH: usize = 16;

/// Raw AES-256 key bytes, wiped on drop and never printed
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LENGTH]);

impl KeyMaterial {
    /// Generate a fresh 256-bit key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

// The catalog file stores key bytes hex-encoded
impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.0));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = Zeroizing::new(hex::decode(encoded.as_str()).map_err(serde::de::Error::custom)?);
        KeyMaterial::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Ciphertext with the IV and tag it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LENGTH],
    pub tag: [u8; TAG_LENGTH],
}

/// Zeroes a borrowed buffer when dropped
pub(crate) struct WipeOnDrop<'a>(pub(crate) &'a mut [u8]);

impl Drop for WipeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Stateless AES-256-GCM cipher for image payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCipher;

impl ImageCipher {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt `plaintext` under a fresh random IV.
    ///
    /// The caller's buffer is zeroed before this returns, whether or not
    /// encryption succeeded.
    pub fn encrypt(&self, key: &KeyMaterial, plaintext: &mut [u8]) -> Result<SealedPayload, CryptoError> {
        let plaintext = WipeOnDrop(plaintext);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut buffer = Zeroizing::new(plaintext.0.to_vec());
        let tag = cipher
            .encrypt_in_place_detached(&nonce, b"", buffer.as_mut_slice())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        // buffer now holds ciphertext only
        let ciphertext = std::mem::take(&mut *buffer);

        let mut iv = [0u8; NONCE_LENGTH];
        iv.copy_from_slice(nonce.as_slice());
        let mut tag_bytes = [0u8; TAG_LENGTH];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(SealedPayload {
            ciphertext,
            iv,
            tag: tag_bytes,
        })
    }

    /// Decrypt into a fresh buffer that is wiped when the caller drops it.
    pub fn decrypt(
        &self,
        key: &KeyMaterial,
        ciphertext: &[u8],
        iv: &[u8; NONCE_LENGTH],
        tag: &[u8; TAG_LENGTH],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.decrypt_in_place(key, buffer.as_mut_slice(), iv, tag)?;
        Ok(buffer)
    }

    /// Decrypt `buffer` in place.
    ///
    /// GCM writes unauthenticated plaintext before it compares tags, so on
    /// a mismatch the buffer is zeroed before the integrity error returns.
    pub fn decrypt_in_place(
        &self,
        key: &KeyMaterial,
        buffer: &mut [u8],
        iv: &[u8; NONCE_LENGTH],
        tag: &[u8; TAG_LENGTH],
    ) -> Result<(), CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let nonce = Nonce::from_slice(iv);
        let tag = Tag::from_slice(tag);

        match cipher.decrypt_in_place_detached(nonce, b"", buffer, tag) {
            Ok(()) => Ok(()),
            Err(_) => {
                buffer.zeroize();
                Err(CryptoError::Integrity)
            }
        }
    }
}
