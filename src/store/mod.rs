//! Crash-safe persistence for the workflow document.
//!
//! - [`FileLock`] serializes writers across processes
//! - [`AtomicJsonStore`] writes through a temp file and atomic rename so
//!   readers never see a partial document
//! - corrupt content is snapshotted into `backups/` and replaced by an empty
//!   document instead of failing the caller

mod backup;
mod json_store;
mod lock;
mod schema;

use std::path::PathBuf;
use std::time::Duration;

pub use backup::{
    backup_name, create_backup, list_backups, parse_backup_name, prune_backups, BackupInfo,
    BackupReason,
};
pub use json_store::AtomicJsonStore;
pub use lock::{FileLock, DEFAULT_POLL_INTERVAL};
pub use schema::{document_from_value, parse_document, parse_document_bytes, validate_document};

/// Errors raised by the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Content does not match the document schema.
    #[error("Schema validation failed: {0}")]
    Validation(String),

    /// The cross-process lock could not be obtained.
    #[error("Timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Requested backup does not exist.
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Content is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error code for structured results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::BackupNotFound(_) => "NOT_FOUND",
            Self::Io(_) | Self::Json(_) => "STORE",
        }
    }
}
