//! Cross-context status exchange.
//!
//! Execution contexts share no memory. The manifest talks to its peers through
//! this narrow publish/poll interface, which is backed by the persisted store.

use formula_storage::{Storage, StorageError, StoredValue};

pub trait StatusChannel: Send + Sync {
    /// Latest message published under `topic` and its version, if any.
    fn poll(&self, topic: &str) -> Result<Option<StoredValue>, StorageError>;

    /// Publish `message` only if `topic` is still at `expected_version`
    /// (`None` = nothing published yet). Returns `false` when another writer
    /// got there first.
    fn publish(
        &self,
        topic: &str,
        expected_version: Option<i64>,
        message: &str,
    ) -> Result<bool, StorageError>;

    /// Remove every topic starting with `prefix`.
    fn retract_prefix(&self, prefix: &str) -> Result<usize, StorageError>;
}

/// [`StatusChannel`] over a [`Storage`] handle.
#[derive(Debug, Clone)]
pub struct StoreChannel {
    storage: Storage,
}

impl StoreChannel {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl StatusChannel for StoreChannel {
    fn poll(&self, topic: &str) -> Result<Option<StoredValue>, StorageError> {
        self.storage.get_versioned(topic)
    }

    fn publish(
        &self,
        topic: &str,
        expected_version: Option<i64>,
        message: &str,
    ) -> Result<bool, StorageError> {
        self.storage.compare_and_swap(topic, expected_version, message)
    }

    fn retract_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        self.storage.delete_prefix(prefix)
    }
}
