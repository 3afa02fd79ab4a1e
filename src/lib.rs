//! # Flowstate
//!
//! Durable workflow state shared between processes.
//!
//! Flowstate keeps a Flow → Plan → Task tree in a single JSON document that
//! several processes may read and write at once, and announces every change
//! on an in-process event bus.
//!
//! ## Components
//!
//! - **[`store`]**: cross-process file lock, atomic JSON writes, backups
//!   and corruption recovery
//! - **[`events`]**: priority event bus with a bounded worker pool, retries
//!   and a dead-letter queue
//! - **[`workflow`]**: the state machine that validates and applies commands
//! - **[`core`]**: configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use flowstate::core::Config;
//! use flowstate::workflow::WorkflowEngine;
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = WorkflowEngine::from_config(&Config::load()?)?;
//! let flow = engine.create_flow("release", BTreeMap::new())?;
//! let plan = engine.create_plan(&flow.id, "v1.0", "First release")?;
//! let task = engine.add_task(&plan.id, "Tag the release", "")?;
//! engine.start_task(&task.id)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]

pub mod core;
pub mod events;
pub mod store;
pub mod workflow;

pub use crate::core::Config;
pub use events::{Event, EventBus, EventHandler, EventType, Priority};
pub use store::{AtomicJsonStore, FileLock, StoreError};
pub use workflow::{CommandOutcome, WorkflowEngine, WorkflowError};

/// Version of the Flowstate library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const APP_NAME: &str = "flowstate";
