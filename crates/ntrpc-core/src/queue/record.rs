//! Job records - Queue execution state persisted in the data store.
//!
//! Three keys per message id make up the whole state of a job:
//! `job:<id>` (status), `job:<id>-retry` (attempts started) and
//! `job:<id>-start` (start of the current attempt, RFC 3339).

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use super::state::JobStatus;
use crate::ports::{DataStore, StoreError};

pub fn status_key(message_id: &str) -> String {
    format!("job:{message_id}")
}

pub fn retry_key(message_id: &str) -> String {
    format!("job:{message_id}-retry")
}

pub fn start_key(message_id: &str) -> String {
    format!("job:{message_id}-start")
}

/// What the store knows about a job at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: Option<JobStatus>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

/// Reads and writes job state for one Queue procedure.
#[derive(Clone)]
pub struct JobRecords {
    store: Arc<dyn DataStore>,
}

impl JobRecords {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Load the state needed for a decision.
    ///
    /// The auxiliary keys are only read for `RUNNING` and `ERROR`. Values that
    /// do not parse are treated as absent.
    pub async fn snapshot(&self, message_id: &str) -> Result<JobSnapshot, StoreError> {
        let status = match self.store.get(&status_key(message_id)).await? {
            Some(raw) => match raw.parse::<JobStatus>() {
                Ok(status) => Some(status),
                Err(error) => {
                    warn!(message_id, %error, "ignoring unrecognised job status");
                    None
                }
            },
            None => None,
        };

        let mut snapshot = JobSnapshot {
            status,
            ..JobSnapshot::default()
        };
        if matches!(status, Some(JobStatus::Running | JobStatus::Error)) {
            snapshot.retry_count = self.retry_count(message_id).await?;
        }
        if status == Some(JobStatus::Running) {
            snapshot.started_at = self.started_at(message_id).await?;
        }
        Ok(snapshot)
    }

    pub async fn set_status(&self, message_id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.store.set(&status_key(message_id), status.as_str()).await
    }

    /// Mark the job RUNNING, bump the attempt counter and stamp the start
    /// time. Returns the attempt number.
    pub async fn start_attempt(&self, message_id: &str, now: DateTime<Utc>) -> Result<u32, StoreError> {
        self.set_status(message_id, JobStatus::Running).await?;
        let attempt = self.retry_count(message_id).await?.saturating_add(1);
        self.store
            .set(&retry_key(message_id), &attempt.to_string())
            .await?;
        self.store
            .set(
                &start_key(message_id),
                &now.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .await?;
        Ok(attempt)
    }

    /// Leave the EXECUTED tombstone and drop the auxiliary keys.
    pub async fn complete(&self, message_id: &str) -> Result<(), StoreError> {
        self.set_status(message_id, JobStatus::Executed).await?;
        self.store.delete(&retry_key(message_id)).await?;
        self.store.delete(&start_key(message_id)).await
    }

    async fn retry_count(&self, message_id: &str) -> Result<u32, StoreError> {
        let raw = self.store.get(&retry_key(message_id)).await?;
        Ok(raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
    }

    async fn started_at(&self, message_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = self.store.get(&start_key(message_id)).await?;
        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryDataStore;
    use chrono::TimeZone;

    fn records() -> (Arc<MemoryDataStore>, JobRecords) {
        let store = Arc::new(MemoryDataStore::new());
        (store.clone(), JobRecords::new(store))
    }

    #[tokio::test]
    async fn unseen_job_has_empty_snapshot() {
        let (_, records) = records();
        assert_eq!(records.snapshot("m1").await.unwrap(), JobSnapshot::default());
    }

    #[tokio::test]
    async fn start_attempt_writes_all_three_keys() {
        let (store, records) = records();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(records.start_attempt("m1", now).await.unwrap(), 1);
        assert_eq!(records.start_attempt("m1", now).await.unwrap(), 2);

        assert_eq!(store.get("job:m1").await.unwrap().as_deref(), Some("RUNNING"));
        assert_eq!(store.get("job:m1-retry").await.unwrap().as_deref(), Some("2"));
        assert_eq!(
            store.get("job:m1-start").await.unwrap().as_deref(),
            Some("2026-03-01T12:00:00.000Z")
        );

        let snap = records.snapshot("m1").await.unwrap();
        assert_eq!(snap.status, Some(JobStatus::Running));
        assert_eq!(snap.retry_count, 2);
        assert_eq!(snap.started_at, Some(now));
    }

    #[tokio::test]
    async fn complete_leaves_only_the_tombstone() {
        let (store, records) = records();
        records.start_attempt("m1", Utc::now()).await.unwrap();
        records.complete("m1").await.unwrap();

        assert_eq!(store.get("job:m1").await.unwrap().as_deref(), Some("EXECUTED"));
        assert_eq!(store.get("job:m1-retry").await.unwrap(), None);
        assert_eq!(store.get("job:m1-start").await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_values_read_as_absent() {
        let (store, records) = records();
        store.set("job:m1", "RUNNING").await.unwrap();
        store.set("job:m1-retry", "many").await.unwrap();
        store.set("job:m1-start", "yesterday").await.unwrap();

        let snap = records.snapshot("m1").await.unwrap();
        assert_eq!(snap.retry_count, 0);
        assert_eq!(snap.started_at, None);

        store.set("job:m2", "PAUSED").await.unwrap();
        assert_eq!(records.snapshot("m2").await.unwrap().status, None);
    }
}
