//! Domain events and their priorities.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of state change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    FlowCreated,
    PlanCreated,
    PlanCompleted,
    PlanArchived,
    PlanDeleted,
    TaskAdded,
    TaskStarted,
    TaskCompleted,
    TaskBlocked,
    TaskCancelled,
    TaskFailed,
    TaskUpdated,
    BackupRestored,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 13] = [
        Self::FlowCreated,
        Self::PlanCreated,
        Self::PlanCompleted,
        Self::PlanArchived,
        Self::PlanDeleted,
        Self::TaskAdded,
        Self::TaskStarted,
        Self::TaskCompleted,
        Self::TaskBlocked,
        Self::TaskCancelled,
        Self::TaskFailed,
        Self::TaskUpdated,
        Self::BackupRestored,
    ];

    /// Wire name, e.g. `TASK_STARTED`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlowCreated => "FLOW_CREATED",
            Self::PlanCreated => "PLAN_CREATED",
            Self::PlanCompleted => "PLAN_COMPLETED",
            Self::PlanArchived => "PLAN_ARCHIVED",
            Self::PlanDeleted => "PLAN_DELETED",
            Self::TaskAdded => "TASK_ADDED",
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskBlocked => "TASK_BLOCKED",
            Self::TaskCancelled => "TASK_CANCELLED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskUpdated => "TASK_UPDATED",
            Self::BackupRestored => "BACKUP_RESTORED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. `Critical` is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::Critical => 3,
            Self::High => 2,
            Self::Normal => 1,
            Self::Low => 0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An immutable state-change notification.
///
/// Retrying produces a new value through [`Event::escalated`]; queued events
/// are never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Unique id, shared by all retries of the same publication
    pub id: Uuid,
    /// What happened
    pub event_type: EventType,
    /// Current delivery priority
    pub priority: Priority,
    /// Event data
    pub payload: Value,
    /// When the event was published
    pub created_at: DateTime<Utc>,
    /// Monotonic publish sequence, the FIFO tie-break within a priority
    pub sequence: u64,
    /// Failed deliveries so far
    pub retry_count: u32,
}

impl Event {
    /// Create a fresh event.
    pub fn new(event_type: EventType, payload: Value, priority: Priority, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            priority,
            payload,
            created_at: Utc::now(),
            sequence,
            retry_count: 0,
        }
    }

    /// The event as redelivered after a failure: one more retry, priority
    /// raised to at least `High`, original sequence kept.
    pub fn escalated(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            priority: self.priority.max(Priority::High),
            ..self.clone()
        }
    }

    /// Payload field as a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Identifier of a registered handler.
pub type SubscriptionId = u64;

/// One pending delivery in the dispatch queue.
///
/// `target` is `None` for a fresh publication (all subscribers) and set to a
/// single subscription for a retry.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub event: Arc<Event>,
    pub target: Option<SubscriptionId>,
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delivery {}

impl Ord for Delivery {
    /// Max-heap order: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| other.event.sequence.cmp(&self.event.sequence))
            .then_with(|| other.event.retry_count.cmp(&self.event.retry_count))
            .then_with(|| other.target.cmp(&self.target))
    }
}

impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
