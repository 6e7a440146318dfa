//! On-disk artifacts: the JSON record log and the index snapshot.

use crate::error::{MemoryError, Result};
use crate::memory::index::Fingerprint;
use crate::memory::types::{EmbeddingModelInfo, MemoryRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Current JSON log format version.
pub const LOG_VERSION: u32 = 1;

/// Locations of a store's two artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// JSON record log, the source of truth.
    pub log: PathBuf,
    /// Binary index snapshot, a rebuildable cache.
    pub snapshot: PathBuf,
}

impl StorePaths {
    pub fn new(data_dir: &Path, store_name: &str) -> Self {
        Self {
            log: data_dir.join(format!("{store_name}_memory.json")),
            snapshot: data_dir.join(format!("{store_name}_memory.index")),
        }
    }
}

#[derive(Serialize)]
struct LogFileRef<'a> {
    version: u32,
    model: &'a EmbeddingModelInfo,
    records: &'a [MemoryRecord],
}

/// Parsed JSON log.
#[derive(Debug, Deserialize)]
pub struct LogFile {
    pub version: u32,
    pub model: EmbeddingModelInfo,
    #[serde(default)]
    pub records: Vec<MemoryRecord>,
}

/// Encode the full JSON log.
pub fn encode_log(model: &EmbeddingModelInfo, records: &[MemoryRecord]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&LogFileRef {
        version: LOG_VERSION,
        model,
        records,
    })
}

/// Parse JSON log bytes read from `path`.
pub fn decode_log(path: &Path, bytes: &[u8]) -> Result<LogFile> {
    let log: LogFile =
        serde_json::from_slice(bytes).map_err(|error| MemoryError::corrupt(path, error))?;
    if log.version != LOG_VERSION {
        return Err(MemoryError::corrupt(path, format!("unsupported log version {}", log.version)).into());
    }
    Ok(log)
}

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Sha256::digest(bytes).into()
}

/// Read a file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(MemoryError::persistence(path, error).into()),
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a partial write.
///
/// The bytes go to a temporary file in the same directory, are fsynced, and
/// the file is renamed over the destination.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(parent).map_err(|error| MemoryError::persistence(path, error))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|error| MemoryError::persistence(path, error))?;
    temp.write_all(bytes)
        .map_err(|error| MemoryError::persistence(path, error))?;
    temp.as_file()
        .sync_all()
        .map_err(|error| MemoryError::persistence(path, error))?;
    temp.persist(path)
        .map_err(|error| MemoryError::persistence(path, error.error))?;

    sync_dir(parent);
    Ok(())
}

/// Flush the directory entry after a rename. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    let result = std::fs::File::open(dir).and_then(|handle| handle.sync_all());
    if let Err(error) = result {
        tracing::debug!(%error, dir = %dir.display(), "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
