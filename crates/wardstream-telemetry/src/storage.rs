//! Durable storage for the error queue
//!
//! [`FileStorage`] keeps a JSON snapshot written via temp file + rename so a
//! crash never leaves a torn snapshot. [`MemoryStorage`] backs tests and
//! hosts without a writable disk.

use crate::report::QueuedError;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use wardstream_error::{Result, WardstreamError};

/// Snapshot storage owned by one error queue
pub trait QueueStorage: Send + Sync {
    /// Loads the persisted queue; empty when nothing was saved
    fn load(&self) -> Result<Vec<QueuedError>>;

    /// Replaces the persisted queue.
    ///
    /// Returns [`WardstreamError::PersistenceQuota`] when the snapshot does
    /// not fit.
    fn save(&self, items: &[QueuedError]) -> Result<()>;

    /// Persisted session id, if any
    fn session_id(&self) -> Result<Option<String>>;

    /// Persists the session id
    fn save_session_id(&self, id: &str) -> Result<()>;
}

fn quota_check(len: usize, quota: Option<u64>) -> Result<()> {
    match quota {
        Some(limit) if len as u64 > limit => Err(WardstreamError::PersistenceQuota(format!(
            "snapshot of {} bytes exceeds {} byte quota",
            len, limit
        ))),
        _ => Ok(()),
    }
}

/// JSON snapshot on disk
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileStorage {
    /// Stores the queue at `path`; the session id goes next to it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quota_bytes: None,
        }
    }

    /// Rejects snapshots larger than `bytes`
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn session_path(&self) -> PathBuf {
        self.path.with_extension("session")
    }

    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = target.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, target)?;
        Ok(())
    }
}

impl QueueStorage for FileStorage {
    fn load(&self) -> Result<Vec<QueuedError>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, items: &[QueuedError]) -> Result<()> {
        let data = serde_json::to_vec(items)?;
        quota_check(data.len(), self.quota_bytes)?;
        self.write_atomic(&self.path, &data)
    }

    fn session_id(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.session_path()) {
            Ok(id) if !id.trim().is_empty() => Ok(Some(id.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_session_id(&self, id: &str) -> Result<()> {
        self.write_atomic(&self.session_path(), id.as_bytes())
    }
}

/// In-process storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<Vec<QueuedError>>,
    session: Mutex<Option<String>>,
    quota_bytes: Option<u64>,
    saves: AtomicU64,
}

impl MemoryStorage {
    /// Empty storage without a quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects snapshots whose JSON is larger than `bytes`
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Storage preloaded with `items`
    pub fn with_items(items: Vec<QueuedError>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Self::default()
        }
    }

    /// Successful saves so far
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Vec<QueuedError> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl QueueStorage for MemoryStorage {
    fn load(&self) -> Result<Vec<QueuedError>> {
        Ok(self.snapshot())
    }

    fn save(&self, items: &[QueuedError]) -> Result<()> {
        if self.quota_bytes.is_some() {
            quota_check(serde_json::to_vec(items)?.len(), self.quota_bytes)?;
        }
        *self.items.lock().unwrap_or_else(|e| e.into_inner()) = items.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn session_id(&self) -> Result<Option<String>> {
        Ok(self.session.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_session_id(&self, id: &str) -> Result<()> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorReport;
    use tempfile::tempdir;
    use wardstream_traits::{ConnectionType, EnvironmentSnapshot};

    fn item(message: &str) -> QueuedError {
        QueuedError::new(
            &ErrorReport::new(message),
            EnvironmentSnapshot {
                viewport: None,
                memory: None,
                online: false,
                connection_type: ConnectionType::Offline,
                platform: "test".to_string(),
            },
            "session",
        )
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("queue").join("errors.json"));

        assert!(storage.load().unwrap().is_empty());
        assert_eq!(storage.session_id().unwrap(), None);

        let items = vec![item("a"), item("b")];
        storage.save(&items).unwrap();
        storage.save_session_id("abc").unwrap();

        assert_eq!(storage.load().unwrap(), items);
        assert_eq!(storage.session_id().unwrap().as_deref(), Some("abc"));
        assert!(!storage.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_file_storage_quota() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("errors.json")).with_quota(64);

        let err = storage.save(&[item("this will not fit")]).unwrap_err();
        assert!(matches!(err, WardstreamError::PersistenceQuota(_)));
        assert!(storage.save(&[]).is_ok());
    }

    #[test]
    fn test_file_storage_rejects_corrupt_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.json");
        fs::write(&path, b"{not json").unwrap();

        assert!(FileStorage::new(path).load().is_err());
    }

    #[test]
    fn test_memory_storage_counts_saves() {
        let storage = MemoryStorage::new();
        storage.save(&[item("a")]).unwrap();
        storage.save(&[]).unwrap();
        assert_eq!(storage.saves(), 2);
        assert!(storage.snapshot().is_empty());
    }
}
