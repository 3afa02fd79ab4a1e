//! Atomic JSON document store.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tempfile::NamedTempFile;

use super::backup::{self, BackupInfo, BackupReason};
use super::lock::FileLock;
use super::schema::{parse_document_bytes, validate_document};
use super::StoreError;
use crate::core::StoreConfig;
use crate::workflow::WorkflowDocument;

/// Durable, concurrency-safe storage for one workflow document.
///
/// Writers are serialized by a sibling `.lock` file. Every write goes to a
/// uniquely named temp file in the same directory, is flushed to disk and
/// then renamed over the live file.
#[derive(Debug, Clone)]
pub struct AtomicJsonStore {
    /// Live document path
    path: PathBuf,
    /// Sibling lock file
    lock_path: PathBuf,
    /// Backup directory
    backups_dir: PathBuf,
    /// File stem used in backup names
    stem: String,
    /// How long to wait for the lock
    lock_timeout: Duration,
    /// Sleep between lock attempts
    lock_poll: Duration,
    /// Minimum age of the newest backup before a save rotates a new one
    backup_interval: Duration,
    /// Number of backups to keep
    backup_retention: usize,
}

impl AtomicJsonStore {
    /// Create a store for `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(path, &StoreConfig::default())
    }

    /// Create a store for `path` using the given settings.
    pub fn from_config(path: impl Into<PathBuf>, config: &StoreConfig) -> Self {
        let path = path.into();

        let mut lock_name = OsString::from(path.as_os_str());
        lock_name.push(".lock");

        let backups_dir =
            path.parent().map_or_else(|| PathBuf::from("backups"), |p| p.join("backups"));
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());

        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            backups_dir,
            stem,
            lock_timeout: config.lock_timeout(),
            lock_poll: config.lock_poll(),
            backup_interval: config.backup_interval(),
            backup_retention: config.backup_retention,
        }
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the backup rotation interval.
    pub fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }

    /// Set how many backups to keep.
    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backup_retention = retention;
        self
    }

    /// Live document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file path.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Backup directory.
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Take the cross-process write lock.
    pub fn lock(&self) -> Result<FileLock, StoreError> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        FileLock::acquire_with_poll(&self.lock_path, self.lock_timeout, self.lock_poll)
    }

    /// Load the document.
    ///
    /// A missing or empty file yields the default document. Unparseable or
    /// invalid content is copied into `backups/` and the default document is
    /// returned; only IO failures reach the caller.
    pub fn load(&self) -> Result<WorkflowDocument, StoreError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(WorkflowDocument::default());
            }
            Err(e) => return Err(e.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(WorkflowDocument::default());
        }

        match parse_document_bytes(&content) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                let reason = match err {
                    StoreError::Json(_) => BackupReason::JsonError,
                    _ => BackupReason::SchemaError,
                };
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Store content is corrupt, falling back to an empty document"
                );
                if let Err(e) =
                    backup::create_backup(&self.path, &self.backups_dir, &self.stem, reason)
                {
                    tracing::error!(error = %e, "Failed to snapshot corrupt store");
                }
                Ok(WorkflowDocument::default())
            }
        }
    }

    /// Validate and persist `doc` under the write lock.
    pub fn save(&self, doc: &WorkflowDocument) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        self.write_locked(doc)
    }

    /// Read-modify-write under one lock hold.
    ///
    /// `apply` mutates a fresh copy of the on-disk document. The copy is
    /// written only if `apply` succeeds; the written document is returned
    /// alongside `apply`'s value.
    pub fn update<T, E, F>(&self, apply: F) -> Result<(T, WorkflowDocument), E>
    where
        F: FnOnce(&mut WorkflowDocument) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _lock = self.lock()?;
        let mut doc = self.load()?;
        let value = apply(&mut doc)?;
        doc.updated_at = Some(Utc::now());
        self.write_locked(&doc)?;
        Ok((value, doc))
    }

    /// Snapshot the live file into `backups/`.
    ///
    /// Returns `None` when there is no live file yet.
    pub fn create_backup(&self, reason: BackupReason) -> Result<Option<BackupInfo>, StoreError> {
        let _lock = self.lock()?;
        self.backup_live(reason)
    }

    /// All backups of this store, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, StoreError> {
        backup::list_backups(&self.backups_dir, &self.stem)
    }

    /// Replace the live file with the named backup.
    ///
    /// The backup is validated before anything is touched; invalid content
    /// is rejected with [`StoreError::Validation`] and the live file stays as
    /// it was. Otherwise the live file is backed up first and then replaced.
    pub fn restore(&self, backup_name: &str) -> Result<WorkflowDocument, StoreError> {
        if backup_name.contains(['/', '\\']) || backup_name.contains("..") {
            return Err(StoreError::BackupNotFound(backup_name.to_string()));
        }
        let source = self.backups_dir.join(backup_name);
        if !source.is_file() {
            return Err(StoreError::BackupNotFound(backup_name.to_string()));
        }

        let _lock = self.lock()?;
        // Read before the pre-restore snapshot, whose pruning may evict `source`.
        let bytes = fs::read(&source)?;
        let doc = parse_document_bytes(&bytes).map_err(|err| {
            tracing::warn!(backup = backup_name, error = %err, "Backup is invalid, not restoring");
            match err {
                StoreError::Json(e) => StoreError::Validation(e.to_string()),
                other => other,
            }
        })?;

        self.backup_live(BackupReason::PreRestore)?;
        self.write_bytes(&bytes)?;
        tracing::info!(backup = backup_name, "Restored store from backup");
        Ok(doc)
    }

    fn backup_live(&self, reason: BackupReason) -> Result<Option<BackupInfo>, StoreError> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let info = backup::create_backup(&self.path, &self.backups_dir, &self.stem, reason)?;
        backup::prune_backups(&self.backups_dir, &self.stem, self.backup_retention)?;
        Ok(Some(info))
    }

    /// Write path; the caller must hold the lock.
    fn write_locked(&self, doc: &WorkflowDocument) -> Result<(), StoreError> {
        validate_document(doc)?;
        self.rotate_backup_if_due()?;

        let mut bytes = serde_json::to_vec_pretty(doc)?;
        bytes.push(b'\n');
        self.write_bytes(&bytes)
    }

    /// Atomically replace the live file with `bytes`.
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        sync_dir(&dir);
        Ok(())
    }

    fn rotate_backup_if_due(&self) -> Result<(), StoreError> {
        let live_len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if live_len == 0 {
            return Ok(());
        }

        let newest = self.list_backups()?.into_iter().next_back();
        let due = match newest {
            None => true,
            Some(info) => {
                let age = SystemTime::now()
                    .duration_since(SystemTime::from(info.created_at))
                    .unwrap_or_default();
                age >= self.backup_interval
            }
        };

        if due {
            self.backup_live(BackupReason::Transaction)?;
        }
        Ok(())
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Persist the rename itself.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
