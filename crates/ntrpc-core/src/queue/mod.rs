//! Queue support: job state, retry bounds and durable resource provisioning.

pub mod provision;
pub mod record;
pub mod retry;
pub mod state;

pub use record::{JobRecords, JobSnapshot};
pub use retry::RetryPolicy;
pub use state::JobStatus;
