//! Error taxonomy for the encryption core

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the cipher primitive
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify: tampered data, wrong key or wrong IV
    #[error("authentication tag mismatch: ciphertext was tampered with or the key/IV is wrong")]
    Integrity,

    #[error("key must be 32 bytes for AES-256, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Errors surfaced by the key store, image service and rotation engine
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption key {0} not found")]
    KeyNotFound(i64),

    #[error("source key {0} not found")]
    SourceKeyNotFound(i64),

    #[error("target key {0} not found")]
    TargetKeyNotFound(i64),

    #[error("rotation {0} not found")]
    RotationNotFound(Uuid),

    #[error("image {0} not found")]
    ImageNotFound(i64),

    #[error("no active encryption key found")]
    NoActiveKey,

    /// A precondition on entity state did not hold
    #[error("{0}")]
    InvalidState(String),

    /// Decryption failed for a reason other than a missing key
    #[error("failed to decrypt with key {kid}: {source}")]
    Decryption {
        kid: i64,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("storage fault: {0}")]
    Storage(String),

    #[error("progress observer disconnected")]
    ObserverClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        VaultError::InvalidState(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        VaultError::Storage(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VaultError::KeyNotFound(_)
                | VaultError::SourceKeyNotFound(_)
                | VaultError::TargetKeyNotFound(_)
                | VaultError::RotationNotFound(_)
                | VaultError::ImageNotFound(_)
                | VaultError::FileNotFound(_)
        )
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, VaultError::InvalidState(_) | VaultError::NoActiveKey)
    }

    /// True when an AEAD tag failed to verify
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            VaultError::Decryption {
                source: CryptoError::Integrity,
                ..
            } | VaultError::Crypto(CryptoError::Integrity)
        )
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
