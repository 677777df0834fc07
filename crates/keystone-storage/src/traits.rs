use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RollbackReason, StoreResult};

/// Handle to an opened store within an engine.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Store {
    id: u32,
    name: Arc<str>,
}

impl Store {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store({}#{})", self.name, self.id)
    }
}

/// A transactional key-value storage engine.
///
/// Implementations must provide snapshot isolation per transaction and must
/// detect write-write conflicts through [`StorageTransaction::get_for_update`]
/// and the write operations. Conflicts never block: the losing transaction is
/// marked rollback-only and its caller retries.
pub trait StorageEngine: Send + Sync {
    /// Open (creating if needed) the store with the given name.
    fn open_store(&self, name: &str) -> StoreResult<Store>;

    /// Begin an untimed transaction.
    fn begin(&self) -> StoreResult<Box<dyn StorageTransaction>>;

    /// Begin a transaction that becomes rollback-only once `timeout` elapses.
    fn begin_timed(&self, timeout: Duration) -> StoreResult<Box<dyn StorageTransaction>>;
}

/// A single storage transaction.
///
/// Once a transaction is rollback-only every further operation fails with
/// [`crate::StoreError::RollbackOnly`]. Dropping a transaction without
/// committing discards its writes and releases its write intents.
pub trait StorageTransaction: Send {
    /// Read a value as of this transaction's snapshot, including its own writes.
    fn get(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Read a value and take a write intent on the key.
    fn get_for_update(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Delete a key. Returns `true` if the key was visible to this transaction.
    fn delete(&mut self, store: &Store, key: &[u8]) -> StoreResult<bool>;

    /// The smallest key strictly greater than `key` (or the first key, when
    /// `key` is `None`).
    fn next_key(&mut self, store: &Store, key: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>>;

    /// Verify the transaction can commit. After a successful prepare, commit
    /// cannot fail for conflict reasons.
    fn prepare(&mut self) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>);

    /// Mark the transaction rollback-only.
    fn mark_rollback(&mut self, reason: RollbackReason);

    /// `Some(reason)` once the transaction is rollback-only.
    fn rollback_reason(&self) -> Option<RollbackReason>;

    fn is_rollback_only(&self) -> bool {
        self.rollback_reason().is_some()
    }
}
