//! Duplicate suppression.
//!
//! An [`IdempotentRepository`] records which keys have been seen; the
//! [`IdempotentConsumer`] gate derives a key from each exchange and consults
//! the repository before letting the exchange continue.

pub mod consumer;
pub mod fifo;
pub mod file;
pub mod memory;

use async_trait::async_trait;

pub use consumer::IdempotentConsumer;
pub use file::{FileIdempotentConfig, FileIdempotentRepository};
pub use memory::MemoryIdempotentRepository;

/// Failure of a repository backend.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository not initialised")]
    NotInitialised,
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Store of seen idempotency keys.
///
/// `add` must be atomic: when several callers race on the same key, exactly
/// one of them observes `true`.
#[async_trait]
pub trait IdempotentRepository: Send + Sync {
    /// Records `key`; returns `true` if this call added it.
    async fn add(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Returns whether `key` is recorded.
    async fn contains(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Deletes `key`; returns whether it was present.
    async fn remove(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Removes every key.
    async fn clear(&self) -> Result<(), RepositoryError>;

    /// Finalises `key` after successful processing.
    ///
    /// Eager repositories have nothing to do and return `true`.
    async fn confirm(&self, _key: &str) -> Result<bool, RepositoryError> {
        Ok(true)
    }
}
