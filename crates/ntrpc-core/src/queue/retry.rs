use std::time::Duration;

use chrono::{DateTime, Utc};

/// Retry and stall bounds for a Queue job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum retries beyond the first attempt.
    pub execution_retry: u32,
    /// Delay applied to `nak` after a failed attempt.
    pub retry_delay: Duration,
    /// Maximum time an attempt may run before it is presumed stalled.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            execution_retry: 1,
            retry_delay: Duration::from_millis(1_000),
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// `retry_count` is the number of attempts already started.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.execution_retry
    }

    /// Start times in the future are never stalled.
    pub fn is_stalled(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - started_at).to_std() {
            Ok(elapsed) => elapsed > self.timeout,
            Err(_) => false,
        }
    }
}
