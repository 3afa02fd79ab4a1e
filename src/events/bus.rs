//! Priority event bus.
//!
//! Publishing is synchronous and never fails: the event is stamped with a
//! sequence number and pushed onto a max-heap ordered by priority, then
//! sequence. A single dispatch loop pops the best delivery whenever a worker
//! slot is free and hands it to a task that invokes every subscriber with a
//! timeout. Failed invocations are retried per handler at escalated priority
//! and end up in the dead-letter queue once the retry budget is spent.
//!
//! ```text
//! publish ─► [heap: priority, sequence] ─► dispatch loop ─► worker slot
//!                 ▲                                             │
//!                 └──── escalated retry ◄── handler failure ◄───┤
//!                                                               └─► dead letters
//! ```

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue, DEFAULT_DEAD_LETTER_CAPACITY};
use super::event::{Delivery, Event, EventType, Priority, SubscriptionId};
use super::handler::{EventHandler, HandlerError};
use super::metrics::{BusMetrics, MetricsRecorder};
use super::retry::{RetryDecision, RetryPolicy};
use crate::core::BusConfig;

/// Runtime settings for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Maximum deliveries handled concurrently
    pub workers: usize,
    /// Per-handler execution timeout
    pub handler_timeout: Duration,
    /// What to do with failed deliveries
    pub retry: RetryPolicy,
    /// Dead-letter ring buffer size
    pub dead_letter_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for BusSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            handler_timeout: config.handler_timeout(),
            retry: RetryPolicy::with_backoff(
                config.max_retries,
                config.retry_delay(),
                config.retry_max_delay(),
            ),
            dead_letter_capacity: if config.dead_letter_capacity == 0 {
                DEFAULT_DEAD_LETTER_CAPACITY
            } else {
                config.dead_letter_capacity
            },
        }
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    settings: BusSettings,
    queue: Mutex<BinaryHeap<Delivery>>,
    notify: Notify,
    subscribers: RwLock<BTreeMap<EventType, Vec<Subscriber>>>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    dead_letters: Mutex<DeadLetterQueue>,
    metrics: Mutex<MetricsRecorder>,
    /// Deliveries popped but not finished
    in_flight: AtomicUsize,
    /// Retries sleeping out their backoff
    delayed: AtomicUsize,
    workers: Arc<Semaphore>,
    shutdown: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// In-process publish/subscribe engine.
///
/// Cloning is cheap and every clone drives the same bus. The owner should
/// call [`EventBus::start`] once inside a tokio runtime and
/// [`EventBus::shutdown`] before exit; events published before `start` wait
/// in the queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("workers", &self.inner.settings.workers)
            .field("queue_depth", &self.queue_depth())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusSettings::default())
    }
}

impl EventBus {
    /// Create a stopped bus.
    pub fn new(settings: BusSettings) -> Self {
        let workers = settings.workers.max(1);
        let dead_letters = DeadLetterQueue::new(settings.dead_letter_capacity);
        Self {
            inner: Arc::new(BusInner {
                settings: BusSettings { workers, ..settings },
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                subscribers: RwLock::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                dead_letters: Mutex::new(dead_letters),
                metrics: Mutex::new(MetricsRecorder::default()),
                in_flight: AtomicUsize::new(0),
                delayed: AtomicUsize::new(0),
                workers: Arc::new(Semaphore::new(workers)),
                shutdown: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Create a bus from file configuration.
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(BusSettings::from(config))
    }

    /// Active settings.
    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    /// Queue an event for delivery and return it.
    pub fn publish(&self, event_type: EventType, payload: Value, priority: Priority) -> Arc<Event> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(Event::new(event_type, payload, priority, sequence));

        self.inner.metrics.lock().record_published(event_type);
        tracing::debug!(
            event = %event_type,
            priority = ?priority,
            sequence,
            "Published event"
        );

        self.inner.enqueue(Delivery { event: Arc::clone(&event), target: None });
        event
    }

    /// Register `handler` for one event type.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe_many(&[event_type], handler)
    }

    /// Register `handler` for several event types under one subscription.
    pub fn subscribe_many(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.inner.subscribers.write();
        for event_type in event_types {
            subscribers
                .entry(*event_type)
                .or_default()
                .push(Subscriber { id, handler: Arc::clone(&handler) });
        }
        tracing::debug!(subscription = id, handler = handler.name(), "Registered handler");
        id
    }

    /// Register `handler` for every event type.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe_many(&EventType::ALL, handler)
    }

    /// Remove a subscription. Pending retries for it are dropped on dispatch.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        let mut subscribers = self.inner.subscribers.write();
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers registered for `event_type`.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner.subscribers.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Spawn the dispatch loop on the current tokio runtime.
    ///
    /// Calling `start` on a running bus does nothing.
    pub fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *dispatcher = Some(tokio::spawn(dispatch_loop(inner)));
        tracing::debug!(workers = self.inner.settings.workers, "Event bus started");
    }

    /// Whether the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop dispatching. Queued events stay queued and are lost on exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();

        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        tracing::debug!("Event bus stopped");
    }

    /// Wait until nothing is queued, in flight or waiting to be retried.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Deliveries waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Snapshot of counters, latency and queue depth.
    pub fn get_metrics(&self) -> BusMetrics {
        BusMetrics {
            by_type: self.inner.metrics.lock().snapshot(),
            queue_depth: self.queue_depth(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            dead_letters: self.inner.dead_letters.lock().len(),
        }
    }

    /// Deliveries that exhausted their retries, oldest first.
    pub fn get_dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.lock().entries()
    }

    /// Remove and return all dead letters.
    pub fn clear_dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.lock().drain()
    }
}

async fn dispatch_loop(inner: Arc<BusInner>) {
    loop {
        // Take a worker slot before choosing the event, so the choice is made
        // among everything queued by the time a worker is actually free.
        let Ok(permit) = Arc::clone(&inner.workers).acquire_owned().await else {
            break;
        };
        let Some(delivery) = inner.next_delivery().await else {
            break;
        };

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            worker.deliver(delivery).await;
            worker.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }
}

impl BusInner {
    fn enqueue(&self, delivery: Delivery) {
        self.queue.lock().push(delivery);
        self.notify.notify_one();
    }

    fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.is_empty()
            && self.in_flight.load(Ordering::SeqCst) == 0
            && self.delayed.load(Ordering::SeqCst) == 0
    }

    /// Block until a delivery is available or the bus shuts down.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut queue = self.queue.lock();
                if let Some(delivery) = queue.pop() {
                    // Counted under the queue lock so idle checks never miss it.
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Some(delivery);
                }
            }
            notified.await;
        }
    }

    fn subscribers_for(&self, delivery: &Delivery) -> Vec<Subscriber> {
        let subscribers = self.subscribers.read();
        let Some(list) = subscribers.get(&delivery.event.event_type) else {
            return Vec::new();
        };
        match delivery.target {
            None => list.clone(),
            Some(target) => list.iter().filter(|s| s.id == target).cloned().collect(),
        }
    }

    async fn deliver(self: &Arc<Self>, delivery: Delivery) {
        let subscribers = self.subscribers_for(&delivery);
        if subscribers.is_empty() {
            tracing::debug!(event = %delivery.event.event_type, "No subscribers for event");
            return;
        }

        let timeout = self.settings.handler_timeout;
        let invocations = subscribers.into_iter().map(|subscriber| {
            let event = Arc::clone(&delivery.event);
            async move {
                let start = Instant::now();
                let result = invoke(Arc::clone(&subscriber.handler), event, timeout).await;
                (subscriber, result, start.elapsed())
            }
        });

        for (subscriber, result, latency) in join_all(invocations).await {
            self.metrics.lock().record_outcome(
                delivery.event.event_type,
                result.is_ok(),
                latency,
            );
            if let Err(error) = result {
                self.handle_failure(&delivery.event, &subscriber, &error);
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, event: &Event, subscriber: &Subscriber, error: &HandlerError) {
        match self.settings.retry.decide(event) {
            RetryDecision::Retry { event: retry, delay } => {
                tracing::warn!(
                    event = %event.event_type,
                    handler = subscriber.handler.name(),
                    retry = retry.retry_count,
                    error = %error,
                    "Handler failed, retrying at escalated priority"
                );
                self.metrics.lock().record_retry(event.event_type);

                let delivery = Delivery { event: Arc::new(retry), target: Some(subscriber.id) };
                if delay.is_zero() {
                    self.enqueue(delivery);
                } else {
                    self.delayed.fetch_add(1, Ordering::SeqCst);
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.enqueue(delivery);
                        inner.delayed.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
            RetryDecision::DeadLetter => {
                tracing::error!(
                    event = %event.event_type,
                    handler = subscriber.handler.name(),
                    retries = event.retry_count,
                    error = %error,
                    "Handler retries exhausted, event dead-lettered"
                );
                self.metrics.lock().record_dead_letter(event.event_type);
                self.dead_letters.lock().push(DeadLetterEntry {
                    event: event.clone(),
                    handler: subscriber.handler.name().to_string(),
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
    }
}

/// Run one handler in its own task so panics and timeouts stay contained.
async fn invoke(
    handler: Arc<dyn EventHandler>,
    event: Arc<Event>,
    timeout: Duration,
) -> Result<(), HandlerError> {
    let mut task = tokio::spawn(async move { handler.handle(&event).await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(HandlerError::Panicked(panic_message(join_error))),
        Err(_) => {
            task.abort();
            Err(HandlerError::Timeout(timeout))
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handler_fn;
    use serde_json::json;

    fn settings(workers: usize) -> BusSettings {
        BusSettings {
            workers,
            handler_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            dead_letter_capacity: 100,
        }
    }

    #[tokio::test]
    async fn test_publish_before_start_is_queued() {
        let bus = EventBus::new(settings(1));
        bus.publish(EventType::TaskAdded, json!({}), Priority::Low);
        bus.publish(EventType::TaskAdded, json!({}), Priority::Low);
        assert_eq!(bus.queue_depth(), 2);
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_delivers_to_every_subscriber() {
        let bus = EventBus::new(settings(2));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(
                EventType::PlanCreated,
                handler_fn(name, move |event| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().push(event.payload_str("plan_id").unwrap_or("").to_string());
                        Ok(())
                    }
                }),
            );
        }

        bus.start();
        bus.publish(EventType::PlanCreated, json!({"plan_id": "p1"}), Priority::Normal);
        assert!(bus.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(seen.lock().as_slice(), ["p1", "p1"]);
        let metrics = bus.get_metrics();
        assert_eq!(metrics.by_type[&EventType::PlanCreated].processed, 2);
        assert_eq!(metrics.queue_depth, 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::new(BusSettings { retry: RetryPolicy::no_retry(), ..settings(1) });
        bus.subscribe(
            EventType::TaskFailed,
            handler_fn("panics", |event| async move {
                assert!(event.payload.is_null(), "handler blew up");
                Ok(())
            }),
        );

        bus.start();
        bus.publish(EventType::TaskFailed, json!({"task_id": "t1"}), Priority::High);
        assert!(bus.wait_idle(Duration::from_secs(5)).await);

        let dead = bus.get_dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("handler blew up"));
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let bus = EventBus::new(BusSettings {
            handler_timeout: Duration::from_millis(20),
            retry: RetryPolicy::no_retry(),
            ..settings(1)
        });
        bus.subscribe(
            EventType::TaskStarted,
            handler_fn("slow", |_event| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        );

        bus.start();
        bus.publish(EventType::TaskStarted, json!({}), Priority::Normal);
        assert!(bus.wait_idle(Duration::from_secs(5)).await);

        let dead = bus.get_dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("timed out"));
        assert_eq!(bus.get_metrics().by_type[&EventType::TaskStarted].failed, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new(settings(1));
        let id = bus.subscribe(EventType::TaskAdded, handler_fn("x", |_e| async { Ok(()) }));
        assert_eq!(bus.subscriber_count(EventType::TaskAdded), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(EventType::TaskAdded), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let bus = EventBus::new(settings(1));
        bus.start();
        assert!(bus.is_running());
        bus.shutdown().await;
        assert!(!bus.is_running());

        bus.publish(EventType::TaskAdded, json!({}), Priority::Low);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.queue_depth(), 1);
    }
}
