//! Flow/Plan/Task state machine.
//!
//! [`WorkflowEngine`] is the only writer of the store. Every command runs the
//! same sequence:
//!
//! 1. take the process-local mutex
//! 2. take the store's file lock and re-read the document from disk
//! 3. validate preconditions and mutate a working copy
//! 4. write the copy atomically
//! 5. on success, swap it into memory and publish the resulting events
//!
//! A failure anywhere before step 5 leaves memory and disk untouched.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::{EntityKind, WorkflowError, WorkflowResult};
use super::model::{Flow, Plan, PlanStatus, Task, TaskLocation, TaskStatus, WorkflowDocument};
use super::status::{FlowStatus, StatusReport};
use crate::core::Config;
use crate::events::{EventBus, EventType, Priority};
use crate::store::{AtomicJsonStore, BackupInfo, BackupReason};

/// An event produced by a command, published only after the save succeeds.
#[derive(Debug)]
struct PendingEvent {
    event_type: EventType,
    payload: Value,
}

impl PendingEvent {
    fn new(event_type: EventType, payload: Value) -> Self {
        Self { event_type, payload }
    }
}

/// Priority each domain event is published at.
fn priority_for(event_type: EventType) -> Priority {
    match event_type {
        EventType::BackupRestored => Priority::Critical,
        EventType::PlanCompleted | EventType::TaskFailed | EventType::TaskBlocked => Priority::High,
        EventType::TaskAdded | EventType::TaskUpdated | EventType::PlanArchived => Priority::Low,
        _ => Priority::Normal,
    }
}

/// The single authority for workflow mutation.
#[derive(Debug)]
pub struct WorkflowEngine {
    store: AtomicJsonStore,
    bus: EventBus,
    /// Process-local command mutex and the last committed document
    state: Mutex<WorkflowDocument>,
}

impl WorkflowEngine {
    /// Open an engine over `store`, publishing to `bus`.
    pub fn new(store: AtomicJsonStore, bus: EventBus) -> WorkflowResult<Self> {
        let doc = store.load()?;
        Ok(Self { store, bus, state: Mutex::new(doc) })
    }

    /// Open an engine from configuration.
    pub fn from_config(config: &Config) -> WorkflowResult<Self> {
        let store = AtomicJsonStore::from_config(config.store.resolved_path(), &config.store);
        Self::new(store, EventBus::from_config(&config.bus))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &AtomicJsonStore {
        &self.store
    }

    /// Copy of the last committed document.
    pub fn document(&self) -> WorkflowDocument {
        self.state.lock().clone()
    }

    /// Re-read the document written by other processes.
    pub fn reload(&self) -> WorkflowResult<()> {
        let mut state = self.state.lock();
        *state = self.store.load()?;
        Ok(())
    }

    fn execute<T, F>(&self, command: &'static str, apply: F) -> WorkflowResult<T>
    where
        F: FnOnce(&mut WorkflowDocument) -> WorkflowResult<(T, Vec<PendingEvent>)>,
    {
        let mut state = self.state.lock();

        let ((value, events), doc) = self.store.update(apply).map_err(|err: WorkflowError| {
            tracing::warn!(command, code = err.code(), error = %err, "Command rejected");
            err
        })?;
        *state = doc;

        for event in events {
            self.bus.publish(event.event_type, event.payload, priority_for(event.event_type));
        }
        tracing::info!(command, "Command applied");
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Create an empty flow.
    pub fn create_flow(&self, name: &str, metadata: BTreeMap<String, Value>) -> WorkflowResult<Flow> {
        self.execute("create_flow", |doc| {
            let flow = Flow {
                id: new_id(),
                name: name.to_string(),
                metadata,
                plans: BTreeMap::new(),
                created_at: Utc::now(),
            };
            doc.flows.insert(flow.id.clone(), flow.clone());

            let event = PendingEvent::new(
                EventType::FlowCreated,
                json!({ "flow_id": flow.id, "name": flow.name }),
            );
            Ok((flow, vec![event]))
        })
    }

    /// Append a `pending` plan to a flow.
    pub fn create_plan(&self, flow_id: &str, name: &str, description: &str) -> WorkflowResult<Plan> {
        self.execute("create_plan", |doc| {
            let flow = doc
                .flows
                .get_mut(flow_id)
                .ok_or_else(|| WorkflowError::not_found(EntityKind::Flow, flow_id))?;

            let now = Utc::now();
            let plan = Plan {
                id: new_id(),
                name: name.to_string(),
                description: description.to_string(),
                status: PlanStatus::Pending,
                archived: false,
                tasks: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            flow.plans.insert(plan.id.clone(), plan.clone());

            let event = PendingEvent::new(
                EventType::PlanCreated,
                json!({ "flow_id": flow_id, "plan_id": plan.id, "name": plan.name }),
            );
            Ok((plan, vec![event]))
        })
    }

    /// Mark a plan archived. Archived plans accept no new tasks.
    pub fn archive_plan(&self, plan_id: &str) -> WorkflowResult<Plan> {
        self.execute("archive_plan", |doc| {
            let flow_id = plan_owner(doc, plan_id)?;
            let plan = plan_in(doc, &flow_id, plan_id)?;
            if plan.archived {
                return Err(WorkflowError::conflict(format!("plan {plan_id} is already archived")));
            }
            plan.archived = true;
            plan.updated_at = Utc::now();

            let event = PendingEvent::new(
                EventType::PlanArchived,
                json!({ "flow_id": flow_id, "plan_id": plan_id }),
            );
            Ok((plan.clone(), vec![event]))
        })
    }

    /// Remove a plan and its tasks.
    pub fn delete_plan(&self, plan_id: &str) -> WorkflowResult<Plan> {
        self.execute("delete_plan", |doc| {
            let flow_id = plan_owner(doc, plan_id)?;
            let plan = doc
                .flows
                .get_mut(&flow_id)
                .and_then(|f| f.plans.remove(plan_id))
                .ok_or_else(|| WorkflowError::not_found(EntityKind::Plan, plan_id))?;

            let task_ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
            let event = PendingEvent::new(
                EventType::PlanDeleted,
                json!({ "flow_id": flow_id, "plan_id": plan_id, "task_ids": task_ids }),
            );
            Ok((plan, vec![event]))
        })
    }

    /// Append a `todo` task to a plan.
    pub fn add_task(&self, plan_id: &str, title: &str, description: &str) -> WorkflowResult<Task> {
        self.execute("add_task", |doc| {
            let flow_id = plan_owner(doc, plan_id)?;
            let plan = plan_in(doc, &flow_id, plan_id)?;
            if plan.archived {
                return Err(WorkflowError::conflict(format!(
                    "plan {plan_id} is archived and accepts no new tasks"
                )));
            }

            let now = Utc::now();
            let mut task = Task {
                id: new_id(),
                title: title.to_string(),
                description: description.to_string(),
                status: TaskStatus::Todo,
                context: BTreeMap::new(),
                actions: Vec::new(),
                notes: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            task.record("created", None);
            plan.tasks.push(task.clone());
            refresh_plan_status(plan);

            let event = PendingEvent::new(EventType::TaskAdded, task_payload(&flow_id, plan_id, &task));
            Ok((task, vec![event]))
        })
    }

    /// Move a `todo` or `blocked` task to `in_progress`.
    ///
    /// Fails with a conflict if another task in the same plan is active.
    pub fn start_task(&self, task_id: &str) -> WorkflowResult<Task> {
        self.execute("start_task", |doc| {
            let (loc, plan) = task_in(doc, task_id)?;

            if let Some(active) = plan.active_task() {
                if active.id != task_id {
                    return Err(WorkflowError::conflict(format!(
                        "task {} is already in progress in plan {}",
                        active.id, plan.id
                    )));
                }
            }

            let task = &mut plan.tasks[loc.index];
            if !matches!(task.status, TaskStatus::Todo | TaskStatus::Blocked) {
                return Err(invalid_transition(task, "start"));
            }
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
            task.record("started", None);
            let task = task.clone();
            refresh_plan_status(plan);

            let event = PendingEvent::new(
                EventType::TaskStarted,
                task_payload(&loc.flow_id, &loc.plan_id, &task),
            );
            Ok((task, vec![event]))
        })
    }

    /// Complete an `in_progress` task. Completing the last open task of a plan
    /// completes the plan as well.
    pub fn complete_task(&self, task_id: &str, notes: Option<&str>) -> WorkflowResult<Task> {
        self.execute("complete_task", |doc| {
            let (loc, plan) = task_in(doc, task_id)?;
            let was_completed = plan.status == PlanStatus::Completed;

            let task = &mut plan.tasks[loc.index];
            if task.status != TaskStatus::InProgress {
                return Err(invalid_transition(task, "complete"));
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.notes = notes.map(str::to_string);
            task.record("completed", task.notes.clone());
            let task = task.clone();
            refresh_plan_status(plan);

            let mut payload = task_payload(&loc.flow_id, &loc.plan_id, &task);
            payload["notes"] = json!(task.notes);
            let mut events = vec![PendingEvent::new(EventType::TaskCompleted, payload)];

            if !was_completed && plan.status == PlanStatus::Completed {
                tracing::info!(plan_id = %plan.id, "All tasks completed, plan completed");
                events.push(PendingEvent::new(
                    EventType::PlanCompleted,
                    json!({ "flow_id": loc.flow_id, "plan_id": plan.id, "name": plan.name }),
                ));
            }
            Ok((task, events))
        })
    }

    /// Cancel any task that is not already finished.
    pub fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> WorkflowResult<Task> {
        self.finish_task(task_id, TaskStatus::Cancelled, reason)
    }

    /// Fail an `in_progress` task.
    pub fn fail_task(&self, task_id: &str, error: Option<&str>) -> WorkflowResult<Task> {
        self.finish_task(task_id, TaskStatus::Failed, error)
    }

    fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        detail: Option<&str>,
    ) -> WorkflowResult<Task> {
        let (command, verb, event_type) = match status {
            TaskStatus::Failed => ("fail_task", "fail", EventType::TaskFailed),
            _ => ("cancel_task", "cancel", EventType::TaskCancelled),
        };

        self.execute(command, |doc| {
            let (loc, plan) = task_in(doc, task_id)?;
            let task = &mut plan.tasks[loc.index];

            let allowed = match status {
                TaskStatus::Failed => task.status == TaskStatus::InProgress,
                _ => !task.status.is_terminal(),
            };
            if !allowed {
                return Err(invalid_transition(task, verb));
            }

            task.status = status;
            task.completed_at = Some(Utc::now());
            task.record(status.as_str(), detail.map(str::to_string));
            let task = task.clone();
            refresh_plan_status(plan);

            let mut payload = task_payload(&loc.flow_id, &loc.plan_id, &task);
            payload["reason"] = json!(detail);
            Ok((task, vec![PendingEvent::new(event_type, payload)]))
        })
    }

    /// Park a `todo` or `in_progress` task as `blocked`.
    pub fn block_task(&self, task_id: &str, reason: Option<&str>) -> WorkflowResult<Task> {
        self.execute("block_task", |doc| {
            let (loc, plan) = task_in(doc, task_id)?;
            let task = &mut plan.tasks[loc.index];
            if !matches!(task.status, TaskStatus::Todo | TaskStatus::InProgress) {
                return Err(invalid_transition(task, "block"));
            }
            task.status = TaskStatus::Blocked;
            task.record("blocked", reason.map(str::to_string));
            let task = task.clone();
            refresh_plan_status(plan);

            let mut payload = task_payload(&loc.flow_id, &loc.plan_id, &task);
            payload["reason"] = json!(reason);
            Ok((task, vec![PendingEvent::new(EventType::TaskBlocked, payload)]))
        })
    }

    /// Set one key of a task's free-form context.
    pub fn set_task_context(&self, task_id: &str, key: &str, value: Value) -> WorkflowResult<Task> {
        self.execute("set_task_context", |doc| {
            let (loc, plan) = task_in(doc, task_id)?;
            let task = &mut plan.tasks[loc.index];
            task.context.insert(key.to_string(), value);
            task.record("context_updated", Some(key.to_string()));
            let task = task.clone();
            plan.updated_at = Utc::now();

            let mut payload = task_payload(&loc.flow_id, &loc.plan_id, &task);
            payload["key"] = json!(key);
            Ok((task, vec![PendingEvent::new(EventType::TaskUpdated, payload)]))
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Status of every flow, or of one flow.
    pub fn get_status(&self, flow_id: Option<&str>) -> WorkflowResult<StatusReport> {
        let state = self.state.lock();
        match flow_id {
            None => Ok(StatusReport::from_document(&state)),
            Some(id) => {
                let flow = state
                    .flows
                    .get(id)
                    .ok_or_else(|| WorkflowError::not_found(EntityKind::Flow, id))?;
                Ok(StatusReport { flows: vec![FlowStatus::from_flow(flow)] })
            }
        }
    }

    pub fn get_flow(&self, flow_id: &str) -> WorkflowResult<Flow> {
        self.state
            .lock()
            .flows
            .get(flow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Flow, flow_id))
    }

    pub fn get_plan(&self, plan_id: &str) -> WorkflowResult<Plan> {
        self.state
            .lock()
            .plan(plan_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Plan, plan_id))
    }

    pub fn get_task(&self, task_id: &str) -> WorkflowResult<Task> {
        self.state
            .lock()
            .task(task_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Task, task_id))
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    /// Backups of the store, oldest first.
    pub fn list_backups(&self) -> WorkflowResult<Vec<BackupInfo>> {
        Ok(self.store.list_backups()?)
    }

    /// Take a manual backup of the live store.
    pub fn create_backup(&self) -> WorkflowResult<Option<BackupInfo>> {
        let _state = self.state.lock();
        Ok(self.store.create_backup(BackupReason::Manual)?)
    }

    /// Replace the store with a backup and reload it.
    pub fn restore_from_backup(&self, backup_name: &str) -> WorkflowResult<WorkflowDocument> {
        let mut state = self.state.lock();
        let doc = self.store.restore(backup_name).map_err(|err| {
            tracing::warn!(backup = backup_name, error = %err, "Restore failed");
            WorkflowError::from(err)
        })?;
        *state = doc.clone();

        self.bus.publish(
            EventType::BackupRestored,
            json!({ "backup": backup_name }),
            priority_for(EventType::BackupRestored),
        );
        tracing::info!(backup = backup_name, "Command applied");
        Ok(doc)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn plan_owner(doc: &WorkflowDocument, plan_id: &str) -> WorkflowResult<String> {
    doc.plan_owner(plan_id)
        .map(str::to_string)
        .ok_or_else(|| WorkflowError::not_found(EntityKind::Plan, plan_id))
}

fn plan_in<'a>(
    doc: &'a mut WorkflowDocument,
    flow_id: &str,
    plan_id: &str,
) -> WorkflowResult<&'a mut Plan> {
    doc.flows
        .get_mut(flow_id)
        .and_then(|f| f.plans.get_mut(plan_id))
        .ok_or_else(|| WorkflowError::not_found(EntityKind::Plan, plan_id))
}

fn task_in<'a>(
    doc: &'a mut WorkflowDocument,
    task_id: &str,
) -> WorkflowResult<(TaskLocation, &'a mut Plan)> {
    let loc = doc
        .locate_task(task_id)
        .ok_or_else(|| WorkflowError::not_found(EntityKind::Task, task_id))?;
    let plan = plan_in(doc, &loc.flow_id, &loc.plan_id)?;
    Ok((loc, plan))
}

fn invalid_transition(task: &Task, verb: &str) -> WorkflowError {
    WorkflowError::conflict(format!("cannot {verb} task {} while it is {}", task.id, task.status))
}

/// Derive the plan status from its tasks.
fn refresh_plan_status(plan: &mut Plan) {
    plan.status = if plan.all_tasks_completed() {
        PlanStatus::Completed
    } else if plan.tasks.iter().any(|t| t.status != TaskStatus::Todo) {
        PlanStatus::InProgress
    } else {
        PlanStatus::Pending
    };
    plan.updated_at = Utc::now();
}

fn task_payload(flow_id: &str, plan_id: &str, task: &Task) -> Value {
    json!({
        "flow_id": flow_id,
        "plan_id": plan_id,
        "task_id": task.id,
        "title": task.title,
        "status": task.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> WorkflowEngine {
        let store = AtomicJsonStore::new(dir.path().join("workflow.json"));
        WorkflowEngine::new(store, EventBus::default()).unwrap()
    }

    #[test]
    fn test_refresh_plan_status() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let flow = engine.create_flow("f", BTreeMap::new()).unwrap();
        let plan = engine.create_plan(&flow.id, "p", "").unwrap();
        assert_eq!(plan.status, PlanStatus::Pending);

        let task = engine.add_task(&plan.id, "t", "").unwrap();
        assert_eq!(engine.get_plan(&plan.id).unwrap().status, PlanStatus::Pending);

        engine.start_task(&task.id).unwrap();
        assert_eq!(engine.get_plan(&plan.id).unwrap().status, PlanStatus::InProgress);
    }

    #[test]
    fn test_lock_timeout_leaves_memory_and_disk_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = AtomicJsonStore::new(dir.path().join("workflow.json"))
            .with_lock_timeout(Duration::from_millis(30));
        let engine = WorkflowEngine::new(store, EventBus::default()).unwrap();
        let flow = engine.create_flow("f", BTreeMap::new()).unwrap();
        let plan = engine.create_plan(&flow.id, "p", "").unwrap();

        let before = engine.document();
        let queued = engine.bus().queue_depth();
        let on_disk = fs::read(engine.store().path()).unwrap();

        // A directory at the lock path can't be cleared as a stale lock.
        fs::create_dir(engine.store().lock_path()).unwrap();
        let err = engine.add_task(&plan.id, "t", "").unwrap_err();

        assert_eq!(err.code(), "LOCK_TIMEOUT");
        assert_eq!(engine.document(), before);
        assert_eq!(engine.bus().queue_depth(), queued);
        assert_eq!(fs::read(engine.store().path()).unwrap(), on_disk);
    }

    #[test]
    fn test_priorities() {
        assert_eq!(priority_for(EventType::BackupRestored), Priority::Critical);
        assert_eq!(priority_for(EventType::PlanCompleted), Priority::High);
        assert_eq!(priority_for(EventType::TaskStarted), Priority::Normal);
        assert_eq!(priority_for(EventType::TaskAdded), Priority::Low);
    }

    #[test]
    fn test_events_queue_in_command_order() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let flow = engine.create_flow("f", BTreeMap::new()).unwrap();
        let plan = engine.create_plan(&flow.id, "p", "").unwrap();
        let task = engine.add_task(&plan.id, "t", "").unwrap();
        engine.start_task(&task.id).unwrap();
        engine.complete_task(&task.id, Some("done")).unwrap();

        // FLOW_CREATED, PLAN_CREATED, TASK_ADDED, TASK_STARTED, TASK_COMPLETED, PLAN_COMPLETED
        assert_eq!(engine.bus().queue_depth(), 6);
        let metrics = engine.bus().get_metrics();
        assert_eq!(metrics.by_type[&EventType::PlanCompleted].published, 1);
    }

    #[test]
    fn test_rejected_command_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(engine.create_plan("missing", "p", "").is_err());
        assert_eq!(engine.bus().queue_depth(), 0);
    }

    #[test]
    fn test_action_log_is_appended() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let flow = engine.create_flow("f", BTreeMap::new()).unwrap();
        let plan = engine.create_plan(&flow.id, "p", "").unwrap();
        let task = engine.add_task(&plan.id, "t", "").unwrap();
        engine.block_task(&task.id, Some("waiting on review")).unwrap();
        engine.start_task(&task.id).unwrap();
        let task = engine.fail_task(&task.id, Some("tests failed")).unwrap();

        let actions: Vec<&str> = task.actions.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec!["created", "blocked", "started", "failed"]);
        assert_eq!(task.actions[3].detail.as_deref(), Some("tests failed"));
    }
}
