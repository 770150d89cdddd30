//! Insertion-ordered key set with optional FIFO eviction.

use std::collections::{HashSet, VecDeque};

/// Set of keys that remembers insertion order.
///
/// With a capacity, inserting beyond it evicts the oldest keys first, so the
/// surviving keys are always the most recently inserted ones.
#[derive(Debug, Clone, Default)]
pub struct FifoSet {
    members: HashSet<String>,
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl FifoSet {
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Inserts `key`; returns `false` if it was already present.
    ///
    /// Re-inserting an existing key does not refresh its position.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.members.contains(key) {
            return false;
        }
        self.members.insert(key.to_string());
        self.order.push_back(key.to_string());
        if let Some(capacity) = self.capacity {
            while self.order.len() > capacity {
                self.pop_oldest();
            }
        }
        true
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    /// Removes and returns the oldest key.
    pub fn pop_oldest(&mut self) -> Option<String> {
        let oldest = self.order.pop_front()?;
        self.members.remove(&oldest);
        Some(oldest)
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in insertion order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
