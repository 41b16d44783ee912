use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted status of one Queue job (`job:<id>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Deferred until its `scheduledAt`.
    Scheduled,
    /// An attempt has started and not reported back.
    Running,
    /// Completed. Kept forever as a dedup tombstone.
    Executed,
    /// Last attempt failed.
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RUNNING" => Ok(JobStatus::Running),
            "EXECUTED" => Ok(JobStatus::Executed),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(UnknownJobStatus(other.to_owned())),
        }
    }
}
