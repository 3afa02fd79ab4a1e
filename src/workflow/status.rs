//! Status reports over the workflow document.

use std::collections::BTreeMap;

use serde::Serialize;

use super::model::{Flow, Plan, PlanStatus, TaskStatus, WorkflowDocument};

/// Status of all (or one) flows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub flows: Vec<FlowStatus>,
}

/// Status of one flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    pub id: String,
    pub name: String,
    pub plans: Vec<PlanSummary>,
}

/// Progress of one plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub status: PlanStatus,
    pub archived: bool,
    pub total_tasks: usize,
    pub task_counts: BTreeMap<TaskStatus, usize>,
    /// Id and title of the task in progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<ActiveTask>,
    /// Completed tasks as a percentage of all tasks
    pub progress: f64,
}

/// The in-progress task of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    pub id: String,
    pub title: String,
}

impl StatusReport {
    /// Build a report for every flow in `doc`.
    pub fn from_document(doc: &WorkflowDocument) -> Self {
        Self { flows: doc.flows.values().map(FlowStatus::from_flow).collect() }
    }

    /// Number of tasks in progress across all flows.
    pub fn active_count(&self) -> usize {
        self.flows.iter().flat_map(|f| &f.plans).filter(|p| p.active_task.is_some()).count()
    }
}

impl FlowStatus {
    pub fn from_flow(flow: &Flow) -> Self {
        let mut plans: Vec<PlanSummary> = flow.plans.values().map(PlanSummary::from_plan).collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Self { id: flow.id.clone(), name: flow.name.clone(), plans }
    }
}

impl PlanSummary {
    pub fn from_plan(plan: &Plan) -> Self {
        let mut task_counts = BTreeMap::new();
        for task in &plan.tasks {
            *task_counts.entry(task.status).or_insert(0) += 1;
        }

        let completed = task_counts.get(&TaskStatus::Completed).copied().unwrap_or(0);
        let progress = if plan.tasks.is_empty() {
            0.0
        } else {
            completed as f64 * 100.0 / plan.tasks.len() as f64
        };

        Self {
            id: plan.id.clone(),
            name: plan.name.clone(),
            status: plan.status,
            archived: plan.archived,
            total_tasks: plan.tasks.len(),
            task_counts,
            active_task: plan
                .active_task()
                .map(|t| ActiveTask { id: t.id.clone(), title: t.title.clone() }),
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Task;
    use chrono::Utc;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
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

    #[test]
    fn test_plan_summary_counts_and_progress() {
        let now = Utc::now();
        let plan = Plan {
            id: "p".to_string(),
            name: "Plan".to_string(),
            description: String::new(),
            status: PlanStatus::InProgress,
            archived: false,
            tasks: vec![
                task("a", TaskStatus::Completed),
                task("b", TaskStatus::InProgress),
                task("c", TaskStatus::Todo),
                task("d", TaskStatus::Completed),
            ],
            created_at: now,
            updated_at: now,
        };

        let summary = PlanSummary::from_plan(&plan);
        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.task_counts.get(&TaskStatus::Completed), Some(&2));
        assert!((summary.progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(summary.active_task.as_ref().map(|t| t.id.as_str()), Some("b"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["task_counts"]["in_progress"], 1);
    }

    #[test]
    fn test_empty_plan_has_zero_progress() {
        let now = Utc::now();
        let plan = Plan {
            id: "p".to_string(),
            name: "Plan".to_string(),
            description: String::new(),
            status: PlanStatus::Pending,
            archived: false,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let summary = PlanSummary::from_plan(&plan);
        assert!(summary.progress.abs() < f64::EPSILON);
        assert!(summary.active_task.is_none());
    }
}
