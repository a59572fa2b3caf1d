//! File-backed state store.
//!
//! One JSON file per poller id under a common directory. Writes are atomic
//! using the write-to-temp-then-rename pattern:
//!
//! 1. Write to `<id>.json.tmp`
//! 2. fsync the file
//! 3. Rename to `<id>.json`
//! 4. fsync the directory
//!
//! Readers therefore always see either the old or the new record, never a
//! partial write. Directory fsync matters: a rename updates the directory
//! entry, and without syncing it the entry may not survive a power loss even
//! though the file contents were synced.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::record::{FORMAT_VERSION, StorageRecord};
use super::store::{Result, StateStore, StoreError};
use crate::types::PollerId;

/// State store writing one JSON file per poller id.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    /// Returns the path a poller's record is stored at.
    pub fn path_for(&self, key: &PollerId) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn write_atomic(&self, path: &Path, record: &StorageRecord) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, path)?;
        fsync_dir(&self.dir)?;
        Ok(())
    }
}

/// Syncs a directory so renames within it are durable.
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    let dir: File = OpenOptions::new().read(true).open(dir)?;
    dir.sync_all()
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &PollerId) -> Result<Option<StorageRecord>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: StorageRecord = serde_json::from_slice(&bytes)?;
        if record.format_version != FORMAT_VERSION {
            return Err(StoreError::FormatMismatch {
                expected: FORMAT_VERSION,
                got: record.format_version,
            });
        }
        Ok(Some(record))
    }

    async fn set(&self, key: &PollerId, record: &StorageRecord) -> Result<()> {
        let path = self.path_for(key);
        self.write_atomic(&path, record)?;
        debug!(poller = %key, path = %path.display(), checkpoint = record.checkpoint.name(), "Checkpoint written");
        Ok(())
    }

    async fn remove(&self, key: &PollerId) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
