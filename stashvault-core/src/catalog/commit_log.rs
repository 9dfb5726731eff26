//! Append-only commit log behind a file-backed catalog
//!
//! Each committed transaction is one JSON line holding the entities it
//! touched. Opening the catalog replays the lines in order; a compaction
//! rewrites the file as a single line describing the live state.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::catalog::ImageMetadata;
use crate::encryption::key_store::EncryptionKey;
use crate::encryption::rotation_state::EncryptionKeyRotation;
use crate::error::{VaultError, VaultResult};

/// Id allocators persisted next to the entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Counters {
    pub next_key_id: i64,
    pub next_image_id: i64,
    pub last_key_version: u32,
}

/// Post-commit value of one touched entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Key(EncryptionKey),
    KeyRemoved(i64),
    Image(ImageMetadata),
    ImageRemoved(i64),
    Rotation(EncryptionKeyRotation),
    RotationRemoved(Uuid),
    Counters(Counters),
}

/// One line of the log
#[derive(Debug, Serialize, Deserialize)]
struct Commit {
    seq: u64,
    records: Vec<LogRecord>,
}

/// Outcome of replaying a log file
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplayStats {
    /// Commits applied
    pub commits: u64,
    /// Records applied across all commits
    pub records: u64,
    /// The last line was cut short or never terminated
    pub torn_tail: bool,
}

impl ReplayStats {
    /// Whether the file holds enough superseded records to be worth rewriting
    pub fn needs_compaction(&self, live_records: u64) -> bool {
        self.torn_tail || self.records > live_records.saturating_mul(2) + COMPACTION_SLACK
    }
}

/// Superseded records tolerated before a reopen rewrites the file
const COMPACTION_SLACK: u64 = 64;

pub(crate) struct CommitLog {
    path: PathBuf,
    last_seq: AtomicU64,
}

impl CommitLog {
    pub fn new(path: PathBuf, last_seq: u64) -> Self {
        Self {
            path,
            last_seq: AtomicU64::new(last_seq),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one commit. Callers serialize appends through the catalog's
    /// write lock.
    pub fn append(&self, records: Vec<LogRecord>) -> VaultResult<()> {
        let seq = self.last_seq.load(Ordering::Relaxed) + 1;
        let mut line = serde_json::to_vec(&Commit { seq, records })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.metadata()?.len();

        if let Err(e) = file.write_all(&line) {
            // Cut the partial line so the next append starts on a clean boundary
            if let Err(truncate) = file.set_len(offset) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %truncate,
                    "Could not trim a partial catalog commit"
                );
            }
            return Err(e.into());
        }

        self.last_seq.store(seq, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the file with a single commit holding `records`
    pub fn rewrite(&self, records: Vec<LogRecord>) -> VaultResult<()> {
        let mut line = serde_json::to_vec(&Commit { seq: 1, records })?;
        line.push(b'\n');

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, line)?;
        fs::rename(&temp_path, &self.path)?;

        self.last_seq.store(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Feed every commit in `path` to `apply`, in file order.
///
/// An unreadable final line is a torn write and is skipped with a warning.
/// An unreadable line followed by valid commits means the file is corrupt.
pub(crate) fn replay(path: &Path, mut apply: impl FnMut(LogRecord)) -> VaultResult<ReplayStats> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut stats = ReplayStats::default();
    let mut bad_line: Option<(usize, serde_json::Error)> = None;
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;

        let terminated = buf.last() == Some(&b'\n');
        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        if let Some((bad, error)) = bad_line.take() {
            return Err(VaultError::storage(format!(
                "catalog {} is corrupt at line {}: {}",
                path.display(),
                bad,
                error
            )));
        }

        match serde_json::from_slice::<Commit>(line) {
            Ok(commit) => {
                stats.commits += 1;
                stats.records += commit.records.len() as u64;
                commit.records.into_iter().for_each(&mut apply);
                if !terminated {
                    stats.torn_tail = true;
                }
            }
            Err(error) => bad_line = Some((line_no, error)),
        }
    }

    if let Some((bad, error)) = bad_line {
        tracing::warn!(
            path = %path.display(),
            line = bad,
            error = %error,
            "Ignoring torn commit at the end of the catalog"
        );
        stats.torn_tail = true;
    }

    Ok(stats)
}
