//! DataStore port - durable string key/value storage for Queue job state.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Shared by every worker instance of a Queue. Needs read-your-writes per
/// key; last write wins is enough.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

impl From<StoreError> for crate::domain::RpcError {
    fn from(error: StoreError) -> Self {
        crate::domain::RpcError::internal("data store operation failed").with_cause(error)
    }
}
