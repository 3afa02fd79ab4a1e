//! Subscriber interface.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::event::Event;

/// Why a handler invocation failed. Never surfaced to publishers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler ran past the bus timeout.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// An event subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and dead-letter entries.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Handler backed by a closure returning a future.
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.func)(event.clone()).await
    }
}

/// Wrap a closure as a handler.
///
/// ```
/// use flowstate::events::handler_fn;
///
/// let handler = handler_fn("audit", |event| async move {
///     tracing::info!(event = %event.event_type, "audit");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), func })
}
