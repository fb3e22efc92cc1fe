use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("store is closed")]
    Closed,
}

/// Durable key→bytes map backing all gateway persistence.
///
/// Writes are assumed durable once the call returns `Ok`. Keys are
/// namespaced by the callers (`twin/`, `reported/`, `identity/`).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Return every entry whose key starts with `prefix`, sorted by key.
    async fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Flush and release the backend. Further calls fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}
