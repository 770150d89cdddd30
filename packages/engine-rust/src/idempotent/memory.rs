//! In-memory idempotent repository.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::fifo::FifoSet;
use super::{IdempotentRepository, RepositoryError};

/// Keeps seen keys in memory, optionally bounded with FIFO eviction.
///
/// All operations take one short `parking_lot` lock, which makes `add`
/// atomic with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct MemoryIdempotentRepository {
    keys: Mutex<FifoSet>,
}

impl MemoryIdempotentRepository {
    /// Unbounded repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository keeping at most `capacity` keys.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Mutex::new(FifoSet::new(Some(capacity))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[async_trait]
impl IdempotentRepository for MemoryIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.lock().insert(key))
    }

    async fn contains(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.lock().contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.lock().remove(key))
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.keys.lock().clear();
        Ok(())
    }
}
