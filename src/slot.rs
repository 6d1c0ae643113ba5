// Slot file operations: one JSON array per slot, rewritten whole on every write

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How the slot looked when it was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No slot file yet
    Missing,
    /// Parsed as a JSON array of records
    Valid,
    /// Present but not a JSON array of records; read as empty
    Malformed,
}

/// Parsed slot plus the digest of the bytes it was parsed from
#[derive(Debug, Clone)]
pub struct SlotContents<T> {
    pub records: Vec<T>,
    pub digest: String,
    pub state: SlotState,
}

/// Content digest used to tell whether a slot changed since it was last seen
pub fn digest_bytes(raw: &[u8]) -> String {
    blake3::hash(raw).to_hex().to_string()
}

/// Read raw slot bytes; a missing slot reads as no bytes
fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read slot file {}", path.display())),
    }
}

/// Digest of the slot as it currently is on disk
pub fn current_digest(path: &Path) -> Result<String> {
    let raw = read_raw(path)?.unwrap_or_default();
    Ok(digest_bytes(&raw))
}

/// Read the full record sequence from a slot
///
/// An absent slot and an unparseable slot both read as an empty sequence.
/// Only genuine I/O failures are errors.
pub fn read_slot<T: DeserializeOwned>(path: &Path) -> Result<SlotContents<T>> {
    let raw = match read_raw(path)? {
        Some(raw) => raw,
        None => {
            return Ok(SlotContents {
                records: Vec::new(),
                digest: digest_bytes(&[]),
                state: SlotState::Missing,
            });
        }
    };

    let digest = digest_bytes(&raw);

    match serde_json::from_slice::<Vec<T>>(&raw) {
        Ok(records) => {
            debug!(file = ?path, count = records.len(), "Loaded slot");
            Ok(SlotContents {
                records,
                digest,
                state: SlotState::Valid,
            })
        }
        Err(e) => {
            warn!(file = ?path, error = ?e, "Slot is not a JSON array of records, treating as empty");
            Ok(SlotContents {
                records: Vec::new(),
                digest,
                state: SlotState::Malformed,
            })
        }
    }
}

/// Replace the slot with the given sequence, returning the digest of what was written
///
/// Writes to a sibling temp file and renames it over the slot, so readers
/// see either the old sequence or the new one.
pub fn write_slot<T: Serialize>(path: &Path, records: &[T]) -> Result<String> {
    let json = serde_json::to_vec(records).context("Failed to serialize slot")?;
    let tmp_path = sibling(path, ".tmp");

    {
        let mut file = File::create(&tmp_path).context("Failed to create temporary slot file")?;
        file.write_all(&json)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace slot file {}", path.display()))?;

    debug!(file = ?path, count = records.len(), "Wrote slot");
    Ok(digest_bytes(&json))
}

/// Copy an unparseable slot aside before it gets replaced
pub fn backup_malformed(path: &Path) -> Result<PathBuf> {
    let backup = sibling(path, &format!(".corrupt-{}", crate::now_ms()));
    fs::copy(path, &backup).with_context(|| format!("Failed to back up malformed slot {}", path.display()))?;
    warn!(file = ?path, backup = ?backup, "Backed up malformed slot before overwriting");
    Ok(backup)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive lock serializing read-modify-write cycles on one slot
///
/// Released when dropped.
pub struct SlotLock {
    file: File,
}

impl SlotLock {
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .context("Failed to open slot lock file")?;

        file.lock_exclusive().context("Failed to acquire slot lock")?;
        Ok(Self { file })
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = ?e, "Failed to release slot lock");
        }
    }
}
