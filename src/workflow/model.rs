//! Workflow document structures.
//!
//! The whole Flow → Plan → Task tree is one serializable document. Every
//! entity is a concrete type with serde (de)serialization to the on-disk
//! JSON format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Root of the persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Schema version
    pub version: u32,

    /// Flows keyed by id
    pub flows: BTreeMap<String, Flow>,

    /// Last successful save
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for WorkflowDocument {
    fn default() -> Self {
        Self { version: SCHEMA_VERSION, flows: BTreeMap::new(), updated_at: None }
    }
}

/// Top-level container of plans, one per project of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Unique flow id
    pub id: String,

    /// Display name
    pub name: String,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    /// Plans keyed by id
    #[serde(default)]
    pub plans: BTreeMap<String, Plan>,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Ordered collection of tasks representing one unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan id
    pub id: String,

    /// Display name
    pub name: String,

    /// Longer description
    #[serde(default)]
    pub description: String,

    /// Lifecycle status
    pub status: PlanStatus,

    /// Archived plans accept no new tasks
    #[serde(default)]
    pub archived: bool,

    /// Tasks in execution order
    #[serde(default)]
    pub tasks: Vec<Task>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// The task currently in progress, if any.
    pub fn active_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::InProgress)
    }

    /// Whether the plan has tasks and all of them are completed.
    pub fn all_tasks_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    /// Find a task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

/// Plan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

impl Default for PlanStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Atomic unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: String,

    /// Short title
    pub title: String,

    /// Longer description
    #[serde(default)]
    pub description: String,

    /// Lifecycle status
    pub status: TaskStatus,

    /// Free-form context
    #[serde(default)]
    pub context: BTreeMap<String, Value>,

    /// Append-only action log
    #[serde(default)]
    pub actions: Vec<ActionRecord>,

    /// Completion notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// When the task last entered `in_progress`
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Record an action in the log.
    pub fn record(&mut self, action: impl Into<String>, detail: Option<String>) {
        self.actions.push(ActionRecord { at: Utc::now(), action: action.into(), detail });
    }
}

/// One entry in a task's action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// When the action happened
    pub at: DateTime<Utc>,

    /// What happened (`created`, `started`, ...)
    pub action: String,

    /// Optional detail (notes, reasons, errors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

impl TaskStatus {
    /// Completed, cancelled and failed tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a task inside the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLocation {
    pub flow_id: String,
    pub plan_id: String,
    pub index: usize,
}

impl WorkflowDocument {
    /// Find the flow that owns a plan.
    pub fn plan_owner(&self, plan_id: &str) -> Option<&str> {
        self.flows
            .values()
            .find(|flow| flow.plans.contains_key(plan_id))
            .map(|flow| flow.id.as_str())
    }

    /// Find a plan by id.
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.flows.values().find_map(|flow| flow.plans.get(plan_id))
    }

    /// Locate a task by id.
    pub fn locate_task(&self, task_id: &str) -> Option<TaskLocation> {
        self.flows.values().find_map(|flow| {
            flow.plans.values().find_map(|plan| {
                plan.tasks.iter().position(|t| t.id == task_id).map(|index| TaskLocation {
                    flow_id: flow.id.clone(),
                    plan_id: plan.id.clone(),
                    index,
                })
            })
        })
    }

    /// Find a task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        let loc = self.locate_task(task_id)?;
        self.flows.get(&loc.flow_id)?.plans.get(&loc.plan_id)?.tasks.get(loc.index)
    }

    /// Total number of tasks across all flows.
    pub fn task_count(&self) -> usize {
        self.flows.values().flat_map(|f| f.plans.values()).map(|p| p.tasks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            context: BTreeMap::new(),
            actions: Vec::new(),
            notes: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn plan_with(tasks: Vec<Task>) -> Plan {
        Plan {
            id: "p1".to_string(),
            name: "Plan".to_string(),
            description: String::new(),
            status: PlanStatus::Pending,
            archived: false,
            tasks,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let status: PlanStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, PlanStatus::Completed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Todo.is_terminal());
    }

    #[test]
    fn test_all_tasks_completed_requires_tasks() {
        assert!(!plan_with(Vec::new()).all_tasks_completed());
        assert!(plan_with(vec![task("a", TaskStatus::Completed)]).all_tasks_completed());
        assert!(!plan_with(vec![
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::Cancelled)
        ])
        .all_tasks_completed());
    }

    #[test]
    fn test_locate_task() {
        let mut doc = WorkflowDocument::default();
        let mut flow = Flow {
            id: "f1".to_string(),
            name: "Flow".to_string(),
            metadata: BTreeMap::new(),
            plans: BTreeMap::new(),
            created_at: Utc::now(),
        };
        flow.plans.insert(
            "p1".to_string(),
            plan_with(vec![task("a", TaskStatus::Todo), task("b", TaskStatus::InProgress)]),
        );
        doc.flows.insert("f1".to_string(), flow);

        let loc = doc.locate_task("b").unwrap();
        assert_eq!(loc.flow_id, "f1");
        assert_eq!(loc.plan_id, "p1");
        assert_eq!(loc.index, 1);
        assert_eq!(doc.plan_owner("p1"), Some("f1"));
        assert_eq!(doc.plan("p1").unwrap().active_task().unwrap().id, "b");
        assert!(doc.locate_task("missing").is_none());
        assert_eq!(doc.task_count(), 2);
    }
}
