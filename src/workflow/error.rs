//! Workflow error types and structured command results.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::store::StoreError;

/// Result type for workflow commands.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Kind of entity an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Flow,
    Plan,
    Task,
    Backup,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Flow => "Flow",
            Self::Plan => "Plan",
            Self::Task => "Task",
            Self::Backup => "Backup",
        })
    }
}

/// Errors returned by engine commands. A failed command persists nothing.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Unknown flow, plan, task or backup.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// The command would break a state-machine invariant.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Document failed schema validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The cross-process lock could not be obtained.
    #[error("Timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Other storage failure.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl WorkflowError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Stable error code for structured results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Store(_) => "STORE",
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::LockTimeout { path, waited } => Self::LockTimeout { path, waited },
            StoreError::BackupNotFound(name) => Self::not_found(EntityKind::Backup, name),
            other => Self::Store(other),
        }
    }
}

/// Structured result handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    /// Whether the command succeeded
    pub success: bool,
    /// Error code on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Command output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandOutcome {
    /// Build an outcome from a command result.
    pub fn from_result<T: Serialize>(result: WorkflowResult<T>, success_message: &str) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(data) => Self {
                    success: true,
                    error_code: None,
                    message: success_message.to_string(),
                    data: Some(data),
                },
                Err(e) => Self::failure("STORE", format!("Failed to encode result: {e}")),
            },
            Err(err) => Self::failure(err.code(), err.to_string()),
        }
    }

    /// A failed outcome.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self { success: false, error_code: Some(code.to_string()), message: message.into(), data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let err: WorkflowError = StoreError::Validation("bad".into()).into();
        assert_eq!(err.code(), "VALIDATION");

        let err: WorkflowError =
            StoreError::LockTimeout { path: PathBuf::from("x.lock"), waited: Duration::ZERO }.into();
        assert_eq!(err.code(), "LOCK_TIMEOUT");

        let err: WorkflowError = StoreError::BackupNotFound("b.json".into()).into();
        assert!(matches!(err, WorkflowError::NotFound { kind: EntityKind::Backup, .. }));
    }

    #[test]
    fn test_outcome_from_error() {
        let outcome = CommandOutcome::from_result::<()>(
            Err(WorkflowError::not_found(EntityKind::Task, "t1")),
            "ok",
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error_code.as_deref(), Some("NOT_FOUND"));
        assert_eq!(outcome.message, "Task not found: t1");
    }

    #[test]
    fn test_outcome_from_success() {
        let outcome = CommandOutcome::from_result(Ok(vec![1, 2]), "listed");
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(serde_json::json!([1, 2])));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(!json.contains("error_code"));
    }
}
