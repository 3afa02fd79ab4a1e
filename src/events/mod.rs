//! In-process event bus.
//!
//! Workflow mutations publish [`Event`]s; subscribers implementing
//! [`EventHandler`] receive them in priority order from a bounded worker
//! pool. Failures are retried at escalated priority and finally recorded as
//! [`DeadLetterEntry`]s. Nothing here is persisted.

mod bus;
mod dead_letter;
mod event;
mod handler;
mod metrics;
mod projection;
mod retry;

pub use bus::{BusSettings, EventBus};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DEFAULT_DEAD_LETTER_CAPACITY};
pub use event::{Event, EventType, Priority, SubscriptionId};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError};
pub use metrics::{BusMetrics, TypeMetrics};
pub use projection::{WorkSummary, WorkSummaryProjector};
pub use retry::{RetryDecision, RetryPolicy};
