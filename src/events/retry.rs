//! Retry policy for failed deliveries.
//!
//! A failed delivery is either escalated and re-queued or dead-lettered once
//! the retry budget is spent. An optional exponential backoff with jitter
//! delays the re-queue.

use std::time::Duration;

use super::event::Event;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry (zero = re-queue immediately).
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 = double each time).
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays (prevents thundering herd).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// What to do with a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Queue this escalated event after `delay`.
    Retry { event: Event, delay: Duration },
    /// Retry budget exhausted.
    DeadLetter,
}

impl RetryPolicy {
    /// Create a policy with no retries (fail fast).
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }

    /// Create a policy with exponential backoff starting at `initial_delay`.
    pub fn with_backoff(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, initial_delay, max_delay, ..Default::default() }
    }

    /// Decide the fate of `event` after a failed delivery.
    pub fn decide(&self, event: &Event) -> RetryDecision {
        if event.retry_count < self.max_retries {
            let next = event.escalated();
            let delay = self.delay_for_attempt(next.retry_count);
            RetryDecision::Retry { event: next, delay }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Calculate delay for the given retry number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external deps.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}
