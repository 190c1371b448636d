//! Durable per-job result storage.
//!
//! Each job gets its own ordered key/value store under
//! `<db_path>/job/<job_id>/`. The store is an append-only JSON-lines record
//! log paired with an in-memory `BTreeMap` index:
//!
//! - **Writes** append a record to `records.log` and update the index.
//! - **Point lookups** and **ordered iteration** are served from the index;
//!   returned values are copied into independently-owned buffers.
//! - **Opening** replays the log into the index. A partial trailing line
//!   (crash mid-write) is detected and truncated, so the log always contains
//!   a valid prefix of records.
//!
//! The store has a single writer (the job's output collector) and admits
//! many readers only after the job has completed, so no internal locking is
//! needed here; callers serialize access.

mod log;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::JobId;
use log::RecordLog;

/// Errors that can occur during result store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error in the record log.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// An ordered, durable key/value store for one job's outputs.
pub struct ResultStore {
    log: RecordLog,
    index: BTreeMap<String, Vec<u8>>,
}

impl ResultStore {
    /// Opens the store rooted at `dir`, creating the directory if needed and
    /// replaying any existing record log into the index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            // The directory entry itself must survive a crash, not just the
            // files later created inside it.
            if let Some(parent) = dir.parent() {
                log::fsync_dir(parent)?;
            }
        }

        let log_path = dir.join("records.log");
        let (records, next_seq) = RecordLog::replay(&log_path)?;

        let mut index = BTreeMap::new();
        for record in records {
            index.insert(record.key, record.value);
        }

        let log = RecordLog::open(&log_path, next_seq)?;
        Ok(ResultStore { log, index })
    }

    /// Writes a value under `key`, overwriting any previous value.
    ///
    /// The record is appended to the log without an immediate fsync; call
    /// [`ResultStore::sync`] to force durability (the collector does this
    /// once before publishing completion).
    pub fn put(&mut self, key: impl Into<String>, value: &[u8]) -> Result<()> {
        let key = key.into();
        self.log.append(&key, value)?;
        self.index.insert(key, value.to_vec());
        Ok(())
    }

    /// Point lookup. Returns an owned copy of the value, or `None` if the
    /// key is absent.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.index.get(key).cloned()
    }

    /// Forward ordered iteration over all keys starting with `prefix`.
    ///
    /// Values are copied out of the index so callers never alias the store's
    /// internal buffers.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of distinct keys in the store.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Forces the record log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        Ok(())
    }
}

/// The on-disk directory for a job's store: `<db_path>/job/<job_id>/`.
pub fn store_dir(db_path: &Path, id: JobId) -> PathBuf {
    db_path.join("job").join(id.to_string())
}

/// Removes a job's store directory. Missing directories are not an error,
/// so deletion is idempotent and works for jobs that never opened a store.
pub async fn remove_store_dir(db_path: &Path, id: JobId) -> Result<()> {
    let dir = store_dir(db_path, id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
