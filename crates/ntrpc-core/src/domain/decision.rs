//! Decision model: whether a delivered Queue job should run.
//!
//! Decider は副作用を持たない。ストアの読み書きと ack/nak は Queue procedure 側で行う。

use chrono::{DateTime, Utc};

use crate::queue::{JobSnapshot, JobStatus, RetryPolicy};

/// Outcome of consulting the stored job state for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// New, scheduled, retryable or reclaimed after a stall.
    Execute,
    /// EXECUTED tombstone present. Ack and skip.
    AlreadyExecuted,
    /// Failed or stalled too often. Ack and drop.
    RetriesExhausted { retries: u32 },
    /// A live attempt holds the job. The delivery is a duplicate; ack it.
    InFlightElsewhere { started_at: DateTime<Utc> },
}

impl Decision {
    pub fn should_execute(&self) -> bool {
        matches!(self, Decision::Execute)
    }
}

/// Decides whether a delivery runs, given the stored state and the time.
///
/// Implementations must be pure: the same snapshot and instant always
/// produce the same decision.
pub trait Decider: Send + Sync {
    fn decide(&self, job: &JobSnapshot, now: DateTime<Utc>) -> Decision;
}

/// Status-driven decider bounded by a `RetryPolicy`.
///
/// - EXECUTED -> skip
/// - ERROR -> retry unless exhausted
/// - RUNNING without start time -> re-execute (inconsistent state)
/// - RUNNING past `timeout` -> retry unless exhausted
/// - RUNNING within `timeout` -> in flight elsewhere
/// - absent / SCHEDULED -> execute
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn retry_or_drop(&self, job: &JobSnapshot) -> Decision {
        if self.policy.is_exhausted(job.retry_count) {
            Decision::RetriesExhausted {
                retries: job.retry_count,
            }
        } else {
            Decision::Execute
        }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, job: &JobSnapshot, now: DateTime<Utc>) -> Decision {
        match job.status {
            Some(JobStatus::Executed) => Decision::AlreadyExecuted,
            Some(JobStatus::Error) => self.retry_or_drop(job),
            Some(JobStatus::Running) => match job.started_at {
                None => Decision::Execute,
                Some(started_at) if self.policy.is_stalled(started_at, now) => {
                    self.retry_or_drop(job)
                }
                Some(started_at) => Decision::InFlightElsewhere { started_at },
            },
            Some(JobStatus::Scheduled) | None => Decision::Execute,
        }
    }
}
