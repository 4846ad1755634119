//! Local key/value storage used to answer `store` and `findValue` requests.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

/// Default number of values kept by [MemoryStore].
pub const MAX_VALUES: usize = 1000;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors returned by [Storage] implementations.
pub enum StorageError {
    /// The store refused the write.
    #[error("Storage rejected write for key {0:?}: {1}")]
    Rejected(String, String),

    /// The backing store is unavailable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage collaborator behind a node.
///
/// Implementations must be safe to call from concurrent request handlers.
pub trait Storage: Debug + Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value`, returning the value it replaced.
    fn put(&self, key: &str, value: String) -> Result<Option<String>, StorageError>;

    /// Delete `key`, returning the value it held.
    fn delete(&self, key: &str) -> Result<Option<String>, StorageError>;
}

/// In-memory [Storage] evicting the least recently used values past its capacity.
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<LruCache<String, String>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            values: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(MAX_VALUES).unwrap_or(NonZeroUsize::MIN))
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<Option<String>, StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(values.put(key.to_string(), value))
    }

    fn delete(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(values.pop(key))
    }
}
