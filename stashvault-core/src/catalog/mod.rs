//! Transactional catalog of keys, images and rotations
//!
//! This is the persistence collaborator of the encryption core:
//! - All-or-nothing transactions, undone from a journal on error or panic
//! - Point-in-time counts for rotation snapshots
//! - Optional durability through an append-only commit log, one line per
//!   transaction holding only the entities it touched

pub mod image;
mod commit_log;

pub use image::*;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::encryption::key_store::{EncryptionKey, KeyStatus};
use crate::encryption::rotation_state::{EncryptionKeyRotation, RotationStatus};
use crate::error::{VaultError, VaultResult};
use commit_log::{CommitLog, Counters, LogRecord};

/// Prior values of everything a running transaction touched.
///
/// `None` means the entity did not exist before the transaction.
#[derive(Debug, Default)]
struct Journal {
    keys: BTreeMap<i64, Option<EncryptionKey>>,
    images: BTreeMap<i64, Option<ImageMetadata>>,
    rotations: BTreeMap<Uuid, Option<EncryptionKeyRotation>>,
    counters: Option<Counters>,
}

impl Journal {
    fn is_empty(&self) -> bool {
        self.keys.is_empty()
            && self.images.is_empty()
            && self.rotations.is_empty()
            && self.counters.is_none()
    }
}

/// Remember the value of `id` the first time a transaction touches it
fn remember<K: Ord + Copy, V: Clone>(
    journal: &mut BTreeMap<K, Option<V>>,
    live: &BTreeMap<K, V>,
    id: K,
) {
    journal.entry(id).or_insert_with(|| live.get(&id).cloned());
}

fn restore<K: Ord, V>(live: &mut BTreeMap<K, V>, prior: BTreeMap<K, Option<V>>) {
    for (id, value) in prior {
        match value {
            Some(value) => {
                live.insert(id, value);
            }
            None => {
                live.remove(&id);
            }
        }
    }
}

/// Everything the catalog stores
#[derive(Debug, Default)]
pub struct CatalogState {
    keys: BTreeMap<i64, EncryptionKey>,
    images: BTreeMap<i64, ImageMetadata>,
    rotations: BTreeMap<Uuid, EncryptionKeyRotation>,
    counters: Counters,
    journal: Journal,
}

impl CatalogState {
    // ---- keys ----

    pub fn key(&self, kid: i64) -> Option<&EncryptionKey> {
        self.keys.get(&kid)
    }

    pub fn key_mut(&mut self, kid: i64) -> Option<&mut EncryptionKey> {
        remember(&mut self.journal.keys, &self.keys, kid);
        self.keys.get_mut(&kid)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EncryptionKey> {
        self.keys.values()
    }

    pub fn keys_mut(&mut self) -> impl Iterator<Item = &mut EncryptionKey> {
        for (kid, key) in &self.keys {
            self.journal
                .keys
                .entry(*kid)
                .or_insert_with(|| Some(key.clone()));
        }
        self.keys.values_mut()
    }

    /// Highest version ever assigned, including keys since deleted
    pub fn max_key_version(&self) -> u32 {
        let stored = self.keys.values().map(|k| k.version).max().unwrap_or(0);
        stored.max(self.counters.last_key_version)
    }

    /// Assign the next key id and version, then store the key
    pub fn insert_key(&mut self, mut key: EncryptionKey) -> EncryptionKey {
        self.touch_counters();
        self.counters.next_key_id += 1;
        key.kid = self.counters.next_key_id;
        key.version = self.max_key_version() + 1;
        self.counters.last_key_version = key.version;

        remember(&mut self.journal.keys, &self.keys, key.kid);
        self.keys.insert(key.kid, key.clone());
        key
    }

    pub fn remove_key(&mut self, kid: i64) -> Option<EncryptionKey> {
        remember(&mut self.journal.keys, &self.keys, kid);
        self.keys.remove(&kid)
    }

    pub fn active_key(&self) -> Option<&EncryptionKey> {
        self.keys
            .values()
            .filter(|k| k.status == KeyStatus::Active)
            .max_by_key(|k| k.version)
    }

    // ---- images ----

    pub fn image(&self, image_id: i64) -> Option<&ImageMetadata> {
        self.images.get(&image_id)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageMetadata> {
        self.images.values()
    }

    /// The image stored at `storage_path`, if any
    pub fn image_at(&self, storage_path: &str) -> Option<&ImageMetadata> {
        self.images
            .values()
            .find(|img| img.storage_path == storage_path)
    }

    pub fn insert_image(&mut self, mut image: ImageMetadata) -> ImageMetadata {
        self.touch_counters();
        self.counters.next_image_id += 1;
        image.image_id = self.counters.next_image_id;

        remember(&mut self.journal.images, &self.images, image.image_id);
        self.images.insert(image.image_id, image.clone());
        image
    }

    /// Replace an existing image row; false if the row is gone
    pub fn replace_image(&mut self, image: ImageMetadata) -> bool {
        if !self.images.contains_key(&image.image_id) {
            return false;
        }
        remember(&mut self.journal.images, &self.images, image.image_id);
        self.images.insert(image.image_id, image);
        true
    }

    pub fn remove_image(&mut self, image_id: i64) -> Option<ImageMetadata> {
        remember(&mut self.journal.images, &self.images, image_id);
        self.images.remove(&image_id)
    }

    pub fn images_referencing(&self, kid: i64) -> impl Iterator<Item = &ImageMetadata> {
        self.images
            .values()
            .filter(move |img| img.encryption_key_id == Some(kid))
    }

    pub fn count_source(&self, source: ImageSource) -> u64 {
        self.images.values().filter(|img| img.matches(source)).count() as u64
    }

    /// Up to `limit` images currently in `source`, in id order, skipping `exclude`
    pub fn fetch_source(
        &self,
        source: ImageSource,
        exclude: &HashSet<i64>,
        limit: usize,
    ) -> Vec<ImageMetadata> {
        self.images
            .values()
            .filter(|img| img.matches(source) && !exclude.contains(&img.image_id))
            .take(limit)
            .cloned()
            .collect()
    }

    // ---- rotations ----

    pub fn rotation(&self, id: Uuid) -> Option<&EncryptionKeyRotation> {
        self.rotations.get(&id)
    }

    pub fn rotation_mut(&mut self, id: Uuid) -> Option<&mut EncryptionKeyRotation> {
        remember(&mut self.journal.rotations, &self.rotations, id);
        self.rotations.get_mut(&id)
    }

    pub fn rotations(&self) -> impl Iterator<Item = &EncryptionKeyRotation> {
        self.rotations.values()
    }

    pub fn insert_rotation(&mut self, rotation: EncryptionKeyRotation) {
        remember(&mut self.journal.rotations, &self.rotations, rotation.id);
        self.rotations.insert(rotation.id, rotation);
    }

    pub fn in_progress_rotations(&self) -> impl Iterator<Item = &EncryptionKeyRotation> {
        self.rotations
            .values()
            .filter(|r| r.status == RotationStatus::InProgress)
    }

    // ---- journal ----

    fn touch_counters(&mut self) {
        if self.journal.counters.is_none() {
            self.journal.counters = Some(self.counters);
        }
    }

    fn rollback(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        restore(&mut self.keys, journal.keys);
        restore(&mut self.images, journal.images);
        restore(&mut self.rotations, journal.rotations);
        if let Some(counters) = journal.counters {
            self.counters = counters;
        }
    }

    /// Current values of everything the running transaction touched
    fn pending_records(&self) -> Vec<LogRecord> {
        let journal = &self.journal;
        let keys = journal.keys.keys().map(|kid| match self.keys.get(kid) {
            Some(key) => LogRecord::Key(key.clone()),
            None => LogRecord::KeyRemoved(*kid),
        });
        let images = journal.images.keys().map(|id| match self.images.get(id) {
            Some(image) => LogRecord::Image(image.clone()),
            None => LogRecord::ImageRemoved(*id),
        });
        let rotations = journal.rotations.keys().map(|id| match self.rotations.get(id) {
            Some(rotation) => LogRecord::Rotation(rotation.clone()),
            None => LogRecord::RotationRemoved(*id),
        });
        let counters = journal
            .counters
            .map(|_| LogRecord::Counters(self.counters));

        keys.chain(images).chain(rotations).chain(counters).collect()
    }

    /// The whole live state as records, for compaction
    fn snapshot_records(&self) -> Vec<LogRecord> {
        self.keys
            .values()
            .cloned()
            .map(LogRecord::Key)
            .chain(self.images.values().cloned().map(LogRecord::Image))
            .chain(self.rotations.values().cloned().map(LogRecord::Rotation))
            .chain(std::iter::once(LogRecord::Counters(self.counters)))
            .collect()
    }

    fn live_records(&self) -> u64 {
        (self.keys.len() + self.images.len() + self.rotations.len() + 1) as u64
    }

    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Key(key) => {
                self.keys.insert(key.kid, key);
            }
            LogRecord::KeyRemoved(kid) => {
                self.keys.remove(&kid);
            }
            LogRecord::Image(image) => {
                self.images.insert(image.image_id, image);
            }
            LogRecord::ImageRemoved(id) => {
                self.images.remove(&id);
            }
            LogRecord::Rotation(rotation) => {
                self.rotations.insert(rotation.id, rotation);
            }
            LogRecord::RotationRemoved(id) => {
                self.rotations.remove(&id);
            }
            LogRecord::Counters(counters) => self.counters = counters,
        }
    }
}

/// Undoes the running transaction when dropped uncommitted, including
/// during unwinding
struct Rollback<'a> {
    state: &'a mut CatalogState,
    committed: bool,
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            self.state.journal = Journal::default();
        } else {
            self.state.rollback();
        }
    }
}

/// Shared handle to the catalog
pub struct Catalog {
    state: RwLock<CatalogState>,
    log: Option<CommitLog>,
}

impl Catalog {
    /// Catalog that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            log: None,
        }
    }

    /// Open a file-backed catalog, starting empty if the file does not exist.
    ///
    /// The log is replayed into memory. A torn final commit is dropped, and
    /// the file is compacted when superseded records dominate it.
    pub fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut state = CatalogState::default();
        let stats = if path.exists() {
            commit_log::replay(&path, |record| state.apply(record))?
        } else {
            Default::default()
        };

        tracing::debug!(
            path = %path.display(),
            commits = stats.commits,
            keys = state.keys.len(),
            images = state.images.len(),
            rotations = state.rotations.len(),
            "Loaded catalog"
        );

        let compact = stats.commits > 0 && stats.needs_compaction(state.live_records());
        let catalog = Self {
            state: RwLock::new(state),
            log: Some(CommitLog::new(path, stats.commits)),
        };

        if compact {
            catalog.compact()?;
        }
        Ok(catalog)
    }

    pub fn path(&self) -> Option<&Path> {
        self.log.as_ref().map(|log| log.path())
    }

    /// Run a read-only query against a consistent view
    pub fn read<R>(&self, query: impl FnOnce(&CatalogState) -> R) -> R {
        let state = self.state.read();
        query(&state)
    }

    /// Run `work` as one transaction.
    ///
    /// `work` mutates the live state under the write lock. If `work` fails,
    /// panics, or its commit cannot be appended, every change is undone.
    /// Readers see either the state before or after, never a partial update.
    pub fn transaction<R>(
        &self,
        work: impl FnOnce(&mut CatalogState) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let mut state = self.state.write();
        let mut guard = Rollback {
            state: &mut *state,
            committed: false,
        };

        let result = work(&mut *guard.state)?;

        if let Some(log) = &self.log {
            if !guard.state.journal.is_empty() {
                log.append(guard.state.pending_records())?;
            }
        }

        guard.committed = true;
        Ok(result)
    }

    /// [`Catalog::transaction`] on the blocking pool, so log appends never
    /// stall an async worker. In-memory catalogs run inline.
    pub async fn spawn_transaction<R, F>(self: &Arc<Self>, work: F) -> VaultResult<R>
    where
        F: FnOnce(&mut CatalogState) -> VaultResult<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.log.is_none() {
            return self.transaction(work);
        }

        let catalog = Arc::clone(self);
        tokio::task::spawn_blocking(move || catalog.transaction(work))
            .await
            .map_err(|e| VaultError::storage(format!("catalog write task failed: {}", e)))?
    }

    /// Apply a change to memory only. Nothing is logged, so the change is
    /// lost when the catalog is reopened.
    pub fn update_unlogged<R>(&self, work: impl FnOnce(&mut CatalogState) -> R) -> R {
        let mut state = self.state.write();
        let result = work(&mut state);
        state.journal = Journal::default();
        result
    }

    /// Rewrite the log as a single commit of the live state
    pub fn compact(&self) -> VaultResult<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };

        let state = self.state.write();
        let records = state.snapshot_records();
        let count = records.len();
        log.rewrite(records)?;

        tracing::info!(path = %log.path().display(), records = count, "Compacted catalog");
        Ok(())
    }
}
