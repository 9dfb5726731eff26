//! Encryption core for StashVault
//!
//! This module provides:
//! - AES-256-GCM image encryption with detached tags
//! - Key lifecycle management with a single Active key
//! - Batch key rotation running in the background
//! - Per-rotation progress streaming

pub mod cipher;
pub mod image_encryption;
pub mod key_rotation;
pub mod key_store;
pub mod progress;
pub mod rotation_state;
mod rotation_worker;

pub use cipher::{ImageCipher, KeyMaterial, SealedPayload, ALGORITHM, KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};
pub use image_encryption::*;
pub use key_rotation::*;
pub use key_store::*;
pub use progress::*;
pub use rotation_state::*;
