//! Document schema validation.
//!
//! The canonical document is `{version, flows: {...}, updated_at}`. Anything
//! else, including the legacy `{plans, current_plan_id}` shape, is a schema
//! error.

use std::collections::HashSet;

use serde_json::Value;

use super::StoreError;
use crate::workflow::{TaskStatus, WorkflowDocument, SCHEMA_VERSION};

/// Parse and validate raw store content.
///
/// Malformed JSON yields [`StoreError::Json`]; well-formed JSON that does not
/// match the schema yields [`StoreError::Validation`].
pub fn parse_document(content: &str) -> Result<WorkflowDocument, StoreError> {
    parse_document_bytes(content.as_bytes())
}

/// Parse and validate raw store bytes. Invalid UTF-8 is a JSON error.
pub fn parse_document_bytes(content: &[u8]) -> Result<WorkflowDocument, StoreError> {
    let value: Value = serde_json::from_slice(content)?;
    document_from_value(value)
}

/// Validate a JSON value against the schema and convert it.
pub fn document_from_value(value: Value) -> Result<WorkflowDocument, StoreError> {
    let root = value
        .as_object()
        .ok_or_else(|| StoreError::Validation("document root must be an object".into()))?;

    let version = root
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Validation("missing or non-integer `version`".into()))?;
    if version > u64::from(SCHEMA_VERSION) {
        return Err(StoreError::Validation(format!(
            "unsupported schema version {version} (max {SCHEMA_VERSION})"
        )));
    }

    match root.get("flows") {
        Some(Value::Object(_)) => {}
        Some(_) => return Err(StoreError::Validation("`flows` must be an object".into())),
        None => return Err(StoreError::Validation("missing `flows`".into())),
    }

    let doc: WorkflowDocument =
        serde_json::from_value(value).map_err(|e| StoreError::Validation(e.to_string()))?;
    validate_document(&doc)?;
    Ok(doc)
}

/// Check the structural invariants of a typed document.
pub fn validate_document(doc: &WorkflowDocument) -> Result<(), StoreError> {
    if doc.version > SCHEMA_VERSION {
        return Err(StoreError::Validation(format!("unsupported schema version {}", doc.version)));
    }

    for (flow_key, flow) in &doc.flows {
        if flow_key != &flow.id {
            return Err(StoreError::Validation(format!(
                "flow key `{flow_key}` does not match id `{}`",
                flow.id
            )));
        }

        for (plan_key, plan) in &flow.plans {
            if plan_key != &plan.id {
                return Err(StoreError::Validation(format!(
                    "plan key `{plan_key}` does not match id `{}`",
                    plan.id
                )));
            }

            let mut seen = HashSet::new();
            let mut active = 0;
            for task in &plan.tasks {
                if !seen.insert(task.id.as_str()) {
                    return Err(StoreError::Validation(format!(
                        "duplicate task id `{}` in plan `{}`",
                        task.id, plan.id
                    )));
                }
                if task.status == TaskStatus::InProgress {
                    active += 1;
                }
            }
            if active > 1 {
                return Err(StoreError::Validation(format!(
                    "plan `{}` has {active} tasks in progress",
                    plan.id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_valid() {
        let doc = parse_document(r#"{"version": 1, "flows": {}}"#).unwrap();
        assert!(doc.flows.is_empty());
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        let err = parse_document("{not json").unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[test]
    fn test_invalid_utf8_is_json_error() {
        let err = parse_document_bytes(b"{\"version\": 1, \"flows\": {\"\xff\": {}}}").unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[test]
    fn test_legacy_plans_shape_is_rejected() {
        let err = parse_document(r#"{"version": 1, "plans": {}, "current_plan_id": null}"#)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m.contains("flows")));
    }

    #[test]
    fn test_future_version_rejected() {
        let err = parse_document(r#"{"version": 99, "flows": {}}"#).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let content = r#"{
            "version": 1,
            "flows": {
                "a": {"id": "b", "name": "x", "created_at": "2024-01-01T00:00:00Z"}
            }
        }"#;
        let err = parse_document(content).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m.contains("does not match")));
    }

    #[test]
    fn test_two_active_tasks_rejected() {
        let task = |id: &str| {
            format!(
                r#"{{"id": "{id}", "title": "{id}", "status": "in_progress",
                    "created_at": "2024-01-01T00:00:00Z"}}"#
            )
        };
        let content = format!(
            r#"{{
                "version": 1,
                "flows": {{
                    "f": {{
                        "id": "f", "name": "f", "created_at": "2024-01-01T00:00:00Z",
                        "plans": {{
                            "p": {{
                                "id": "p", "name": "p", "status": "in_progress",
                                "created_at": "2024-01-01T00:00:00Z",
                                "updated_at": "2024-01-01T00:00:00Z",
                                "tasks": [{}, {}]
                            }}
                        }}
                    }}
                }}
            }}"#,
            task("t1"),
            task("t2")
        );
        let err = parse_document(&content).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m.contains("in progress")));
    }
}
