//! Image rows and the crypto metadata they carry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encryption::cipher::{NONCE_LENGTH, TAG_LENGTH};

/// Image metadata as far as the encryption core is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub image_id: i64,

    /// Opaque locator handed to the file storage
    pub storage_path: String,

    pub content_type: Option<String>,

    pub is_encrypted: bool,

    /// Key the stored bytes are sealed with; None iff not encrypted
    pub encryption_key_id: Option<i64>,

    #[serde(default, with = "hex_opt")]
    pub initialization_vector: Option<[u8; NONCE_LENGTH]>,

    #[serde(default, with = "hex_opt")]
    pub authentication_tag: Option<[u8; TAG_LENGTH]>,

    pub size_in_bytes: u64,

    pub uploaded_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ImageMetadata {
    /// Key id, IV and tag, only when all three are present
    pub fn crypto_fields(&self) -> Option<(i64, [u8; NONCE_LENGTH], [u8; TAG_LENGTH])> {
        match (
            self.encryption_key_id,
            self.initialization_vector,
            self.authentication_tag,
        ) {
            (Some(kid), Some(iv), Some(tag)) => Some((kid, iv, tag)),
            _ => None,
        }
    }

    pub fn matches(&self, source: ImageSource) -> bool {
        match source {
            ImageSource::Unencrypted => !self.is_encrypted,
            ImageSource::EncryptedWith(kid) => {
                self.is_encrypted && self.encryption_key_id == Some(kid)
            }
        }
    }
}

/// Population of images a rotation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Images that have never been encrypted
    Unencrypted,
    /// Images currently sealed with the given key
    EncryptedWith(i64),
}

mod hex_opt {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(value: &Option<[u8; N]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|h| {
                let bytes = hex::decode(&h).map_err(D::Error::custom)?;
                <[u8; N]>::try_from(bytes.as_slice())
                    .map_err(|_| D::Error::custom(format!("expected {} bytes, got {}", N, bytes.len())))
            })
            .transpose()
    }
}
