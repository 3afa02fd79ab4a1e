//! Read-only work summary built purely from events.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use super::event::{Event, EventType};
use super::handler::{EventHandler, HandlerError};
use crate::workflow::{TaskStatus, WorkflowDocument};

/// Current-work summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkSummary {
    /// Number of tasks per status
    pub task_counts: BTreeMap<TaskStatus, usize>,
    /// In-progress task per plan
    pub active_tasks: BTreeMap<String, String>,
    /// Known plans
    pub plans: usize,
    /// Plans that reached `completed`
    pub completed_plans: usize,
    /// Events applied since the last rebuild
    pub events_applied: u64,
    /// Set when the store was restored and the summary may be out of date
    pub stale: bool,
}

#[derive(Debug, Default)]
struct State {
    /// task id -> (plan id, status)
    tasks: BTreeMap<String, (String, TaskStatus)>,
    /// plan id -> completed
    plans: BTreeMap<String, bool>,
    active: BTreeMap<String, String>,
    /// Deleted plan ids; late events for them are dropped
    deleted: BTreeSet<String>,
    events_applied: u64,
    stale: bool,
}

/// Subscriber that maintains a [`WorkSummary`].
///
/// Subscribe it with [`EventBus::subscribe_all`](super::EventBus::subscribe_all).
#[derive(Debug, Default)]
pub struct WorkSummaryProjector {
    state: RwLock<State>,
}

impl WorkSummaryProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the projection from a full document.
    pub fn rebuild_from(&self, doc: &WorkflowDocument) {
        let mut state = State::default();
        for plan in doc.flows.values().flat_map(|f| f.plans.values()) {
            state.plans.insert(plan.id.clone(), plan.all_tasks_completed());
            for task in &plan.tasks {
                state.tasks.insert(task.id.clone(), (plan.id.clone(), task.status));
                if task.status == TaskStatus::InProgress {
                    state.active.insert(plan.id.clone(), task.id.clone());
                }
            }
        }
        *self.state.write() = state;
    }

    /// Snapshot of the summary.
    pub fn summary(&self) -> WorkSummary {
        let state = self.state.read();
        let mut task_counts = BTreeMap::new();
        for (_, status) in state.tasks.values() {
            *task_counts.entry(*status).or_insert(0) += 1;
        }
        WorkSummary {
            task_counts,
            active_tasks: state.active.clone(),
            plans: state.plans.len(),
            completed_plans: state.plans.values().filter(|done| **done).count(),
            events_applied: state.events_applied,
            stale: state.stale,
        }
    }

    fn apply(&self, event: &Event) -> Result<(), HandlerError> {
        let field = |key: &str| {
            event.payload_str(key).map(str::to_string).ok_or_else(|| {
                HandlerError::failed(format!("{} payload missing `{key}`", event.event_type))
            })
        };

        let mut state = self.state.write();
        if let Some(plan_id) = event.payload_str("plan_id") {
            if state.deleted.contains(plan_id) {
                state.events_applied += 1;
                return Ok(());
            }
        }

        match event.event_type {
            EventType::FlowCreated | EventType::TaskUpdated | EventType::PlanArchived => {}
            EventType::PlanCreated => {
                state.plans.entry(field("plan_id")?).or_insert(false);
            }
            EventType::PlanCompleted => {
                state.plans.insert(field("plan_id")?, true);
            }
            EventType::PlanDeleted => {
                let plan_id = field("plan_id")?;
                state.plans.remove(&plan_id);
                state.active.remove(&plan_id);
                state.tasks.retain(|_, (owner, _)| *owner != plan_id);
                state.deleted.insert(plan_id);
            }
            // Low-priority events may arrive after later transitions of the same task
            EventType::TaskAdded => {
                let plan_id = field("plan_id")?;
                state.tasks.entry(field("task_id")?).or_insert((plan_id, TaskStatus::Todo));
            }
            EventType::TaskStarted => {
                let (task_id, plan_id) = (field("task_id")?, field("plan_id")?);
                state.active.insert(plan_id.clone(), task_id.clone());
                state.tasks.insert(task_id, (plan_id, TaskStatus::InProgress));
            }
            EventType::TaskCompleted
            | EventType::TaskBlocked
            | EventType::TaskCancelled
            | EventType::TaskFailed => {
                let status = match event.event_type {
                    EventType::TaskCompleted => TaskStatus::Completed,
                    EventType::TaskBlocked => TaskStatus::Blocked,
                    EventType::TaskCancelled => TaskStatus::Cancelled,
                    _ => TaskStatus::Failed,
                };
                let (task_id, plan_id) = (field("task_id")?, field("plan_id")?);
                if state.active.get(&plan_id) == Some(&task_id) {
                    state.active.remove(&plan_id);
                }
                state.tasks.insert(task_id, (plan_id, status));
            }
            EventType::BackupRestored => {
                state.stale = true;
            }
        }
        state.events_applied += 1;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for WorkSummaryProjector {
    fn name(&self) -> &str {
        "work-summary"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.apply(event)
    }
}
