//! Timestamped store backups.
//!
//! Backups live in a `backups/` directory next to the store and are named
//! `<store>_<timestamp>_<reason>.json`, so lexical order is chronological.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;

use super::StoreError;

/// Timestamp layout embedded in backup names.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Number of `_`-separated fields in [`TIMESTAMP_FORMAT`].
const TIMESTAMP_FIELDS: usize = 3;

/// Why a backup was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    /// Store content failed schema validation on load
    SchemaError,
    /// Store content was not valid JSON
    JsonError,
    /// Periodic rotation during a save
    Transaction,
    /// Requested explicitly
    Manual,
    /// Snapshot of the live file taken before a restore
    PreRestore,
    /// Any other reason found on disk
    Other(String),
}

impl BackupReason {
    /// Suffix used in file names.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SchemaError => "schema_error",
            Self::JsonError => "json_error",
            Self::Transaction => "transaction",
            Self::Manual => "manual",
            Self::PreRestore => "pre_restore",
            Self::Other(s) => s,
        }
    }

    /// Parse a file-name suffix.
    pub fn parse(s: &str) -> Self {
        match s {
            "schema_error" => Self::SchemaError,
            "json_error" => Self::JsonError,
            "transaction" => Self::Transaction,
            "manual" => Self::Manual,
            "pre_restore" => Self::PreRestore,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for BackupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup file on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    /// File name (used to restore)
    pub name: String,
    /// Full path
    #[serde(skip)]
    pub path: PathBuf,
    /// When the backup was taken
    pub created_at: DateTime<Utc>,
    /// Why it was taken
    pub reason: BackupReason,
    /// Size in bytes
    pub size: u64,
}

/// Build the file name for a backup.
pub fn backup_name(stem: &str, at: DateTime<Utc>, reason: &BackupReason) -> String {
    format!("{}_{}_{}.json", stem, at.format(TIMESTAMP_FORMAT), reason.as_str())
}

/// Parse a backup file name belonging to `stem`.
pub fn parse_backup_name(stem: &str, name: &str) -> Option<(DateTime<Utc>, BackupReason)> {
    let rest = name.strip_prefix(stem)?.strip_prefix('_')?.strip_suffix(".json")?;
    let mut parts = rest.splitn(TIMESTAMP_FIELDS + 1, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let micros = parts.next()?;
    let reason = parts.next().filter(|r| !r.is_empty())?;

    let stamp = format!("{date}_{time}_{micros}");
    let naive = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).ok()?;
    Some((naive.and_utc(), BackupReason::parse(reason)))
}

/// Copy `source` into `dir` as a new backup.
pub fn create_backup(
    source: &Path,
    dir: &Path,
    stem: &str,
    reason: BackupReason,
) -> Result<BackupInfo, StoreError> {
    fs::create_dir_all(dir)?;

    let mut at = Utc::now();
    let mut path = dir.join(backup_name(stem, at, &reason));
    while path.exists() {
        at += ChronoDuration::microseconds(1);
        path = dir.join(backup_name(stem, at, &reason));
    }

    let size = fs::copy(source, &path)?;
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    tracing::debug!(backup = %name, reason = %reason, "Created store backup");

    Ok(BackupInfo { name, path, created_at: at, reason, size })
}

/// List backups for `stem`, oldest first.
pub fn list_backups(dir: &Path, stem: &str) -> Result<Vec<BackupInfo>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((created_at, reason)) = parse_backup_name(stem, &name) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        backups.push(BackupInfo { name, path: entry.path(), created_at, reason, size });
    }

    backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
    Ok(backups)
}

/// Delete the oldest backups so at most `retention` remain.
pub fn prune_backups(dir: &Path, stem: &str, retention: usize) -> Result<usize, StoreError> {
    let backups = list_backups(dir, stem)?;
    let excess = backups.len().saturating_sub(retention);

    for backup in backups.iter().take(excess) {
        if let Err(e) = fs::remove_file(&backup.path) {
            tracing::warn!(backup = %backup.name, error = %e, "Failed to prune backup");
        }
    }
    if excess > 0 {
        tracing::debug!(removed = excess, retention, "Pruned old backups");
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backup_name_round_trip() {
        let at = Utc::now();
        let name = backup_name("workflow", at, &BackupReason::JsonError);
        assert!(name.starts_with("workflow_"));
        assert!(name.ends_with("_json_error.json"));

        let (parsed_at, reason) = parse_backup_name("workflow", &name).unwrap();
        assert_eq!(reason, BackupReason::JsonError);
        assert_eq!(parsed_at.timestamp_micros(), at.timestamp_micros());
    }

    #[test]
    fn test_parse_rejects_other_stems() {
        let name = backup_name("workflow_x", Utc::now(), &BackupReason::Manual);
        assert!(parse_backup_name("workflow", &name).is_none());
        assert!(parse_backup_name("workflow", "workflow.json").is_none());
    }

    #[test]
    fn test_create_list_and_prune() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("workflow.json");
        fs::write(&source, "{}").unwrap();
        let backups_dir = dir.path().join("backups");

        for _ in 0..5 {
            create_backup(&source, &backups_dir, "workflow", BackupReason::Transaction).unwrap();
        }
        assert_eq!(list_backups(&backups_dir, "workflow").unwrap().len(), 5);

        let removed = prune_backups(&backups_dir, "workflow", 3).unwrap();
        assert_eq!(removed, 2);

        let remaining = list_backups(&backups_dir, "workflow").unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let backups = list_backups(&dir.path().join("nope"), "workflow").unwrap();
        assert!(backups.is_empty());
    }
}
