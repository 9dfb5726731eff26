//! StashVault Core - image encryption and key lifecycle
//!
//! This crate provides the encryption core of the StashVault inventory
//! tracker:
//! - AES-256-GCM encryption of stored images
//! - Encryption key lifecycle with a single Active key
//! - Background key rotation with progress streaming
//! - A transactional catalog of keys, images and rotations

pub mod catalog;
pub mod clock;
pub mod config;
pub mod encryption;
pub mod error;
pub mod monitoring;
pub mod storage;
pub mod vault;

pub use catalog::{Catalog, CatalogState, ImageMetadata, ImageSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use encryption::*;
pub use error::{CryptoError, VaultError, VaultResult};
pub use monitoring::*;
pub use storage::{FileStorage, LocalFileStorage, MemoryFileStorage};
pub use vault::Vault;
