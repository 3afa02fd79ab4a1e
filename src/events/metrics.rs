//! Delivery counters for health checks. Process-local, never persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::event::EventType;

/// Read-only snapshot of bus activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusMetrics {
    /// Counters per event type
    pub by_type: BTreeMap<EventType, TypeMetrics>,
    /// Deliveries waiting in the queue
    pub queue_depth: usize,
    /// Deliveries currently being handled
    pub in_flight: usize,
    /// Entries in the dead-letter queue
    pub dead_letters: usize,
}

impl BusMetrics {
    /// Successful handler invocations across all types.
    pub fn total_processed(&self) -> u64 {
        self.by_type.values().map(|m| m.processed).sum()
    }

    /// Failed handler invocations across all types.
    pub fn total_failed(&self) -> u64 {
        self.by_type.values().map(|m| m.failed).sum()
    }
}

/// Counters for one event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeMetrics {
    /// Events published
    pub published: u64,
    /// Successful handler invocations
    pub processed: u64,
    /// Failed handler invocations (errors, timeouts, panics)
    pub failed: u64,
    /// Deliveries re-queued for retry
    pub retried: u64,
    /// Deliveries given up
    pub dead_lettered: u64,
    /// Mean handler latency in milliseconds
    pub avg_latency_ms: f64,
}

/// Mutable accumulator behind [`BusMetrics`].
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    counters: BTreeMap<EventType, Counters>,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    published: u64,
    processed: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    total_latency: Duration,
    samples: u64,
}

impl MetricsRecorder {
    pub fn record_published(&mut self, event_type: EventType) {
        self.entry(event_type).published += 1;
    }

    pub fn record_outcome(&mut self, event_type: EventType, success: bool, latency: Duration) {
        let c = self.entry(event_type);
        if success {
            c.processed += 1;
        } else {
            c.failed += 1;
        }
        c.total_latency += latency;
        c.samples += 1;
    }

    pub fn record_retry(&mut self, event_type: EventType) {
        self.entry(event_type).retried += 1;
    }

    pub fn record_dead_letter(&mut self, event_type: EventType) {
        self.entry(event_type).dead_lettered += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<EventType, TypeMetrics> {
        self.counters
            .iter()
            .map(|(ty, c)| {
                let avg_latency_ms = if c.samples == 0 {
                    0.0
                } else {
                    c.total_latency.as_secs_f64() * 1000.0 / c.samples as f64
                };
                let metrics = TypeMetrics {
                    published: c.published,
                    processed: c.processed,
                    failed: c.failed,
                    retried: c.retried,
                    dead_lettered: c.dead_lettered,
                    avg_latency_ms,
                };
                (*ty, metrics)
            })
            .collect()
    }

    fn entry(&mut self, event_type: EventType) -> &mut Counters {
        self.counters.entry(event_type).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_latency() {
        let mut recorder = MetricsRecorder::default();
        recorder.record_published(EventType::TaskStarted);
        recorder.record_outcome(EventType::TaskStarted, true, Duration::from_millis(10));
        recorder.record_outcome(EventType::TaskStarted, false, Duration::from_millis(30));

        let snapshot = recorder.snapshot();
        let m = &snapshot[&EventType::TaskStarted];
        assert_eq!(m.published, 1);
        assert_eq!(m.processed, 1);
        assert_eq!(m.failed, 1);
        assert!((m.avg_latency_ms - 20.0).abs() < 0.001);
    }

    #[test]
    fn test_totals() {
        let mut recorder = MetricsRecorder::default();
        recorder.record_outcome(EventType::TaskAdded, true, Duration::ZERO);
        recorder.record_outcome(EventType::PlanCreated, true, Duration::ZERO);
        recorder.record_outcome(EventType::PlanCreated, false, Duration::ZERO);

        let metrics = BusMetrics { by_type: recorder.snapshot(), ..Default::default() };
        assert_eq!(metrics.total_processed(), 2);
        assert_eq!(metrics.total_failed(), 1);
    }
}
