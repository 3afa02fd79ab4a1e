//! Bounded dead-letter queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::Event;

/// Default number of entries kept.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// A delivery that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// The event as last attempted
    pub event: Event,
    /// Handler that kept failing
    pub handler: String,
    /// Last error message
    pub error: String,
    /// When the delivery was given up
    pub failed_at: DateTime<Utc>,
}

/// Ring buffer of dead letters; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetterEntry>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity.min(64)), capacity, evicted: 0 }
    }

    /// Append an entry, evicting the oldest one if full.
    pub fn push(&mut self, entry: DeadLetterEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<DeadLetterEntry> {
        self.entries.drain(..).collect()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, Priority};
    use serde_json::json;

    fn entry(n: u64) -> DeadLetterEntry {
        DeadLetterEntry {
            event: Event::new(EventType::TaskAdded, json!({ "n": n }), Priority::Normal, n),
            handler: "h".to_string(),
            error: "boom".to_string(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut queue = DeadLetterQueue::new(2);
        queue.push(entry(1));
        queue.push(entry(2));
        queue.push(entry(3));

        let sequences: Vec<u64> = queue.entries().iter().map(|e| e.event.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(queue.evicted(), 1);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = DeadLetterQueue::default();
        queue.push(entry(1));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
