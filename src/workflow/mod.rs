//! Flow → Plan → Task workflow state.
//!
//! [`WorkflowEngine`] owns the persisted [`WorkflowDocument`] and is the only
//! component that mutates it. Every successful command is written through
//! the atomic store and then announced on the event bus.

mod engine;
mod error;
mod model;
mod status;

pub use engine::WorkflowEngine;
pub use error::{CommandOutcome, EntityKind, WorkflowError, WorkflowResult};
pub use model::{
    ActionRecord, Flow, Plan, PlanStatus, Task, TaskLocation, TaskStatus, WorkflowDocument,
    SCHEMA_VERSION,
};
pub use status::{ActiveTask, FlowStatus, PlanSummary, StatusReport};
