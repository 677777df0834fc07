use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{RollbackReason, StoreError, StoreResult};
use crate::traits::{StorageEngine, StorageTransaction, Store};

type StoreKey = (u32, Vec<u8>);

/// Committed state: an immutable map shared with open snapshots, plus the
/// commit version at which each key last changed (deletes included).
struct Committed {
    data: Arc<BTreeMap<StoreKey, Vec<u8>>>,
    modified_at: HashMap<StoreKey, u64>,
    version: u64,
}

struct EngineState {
    committed: RwLock<Committed>,
    stores: RwLock<HashMap<String, Store>>,
    /// Write intents: key -> id of the transaction holding it.
    intents: Mutex<HashMap<StoreKey, u64>>,
    next_tx: AtomicU64,
}

/// In-memory, `BTreeMap`-based storage engine.
///
/// Intended for tests, embedding, and the coordination server's canonical
/// store. Transactions read from a copy-on-write snapshot taken at begin time;
/// writes are buffered locally and published atomically on commit. The first
/// transaction to take a write intent on a key wins; any other transaction that
/// touches the key for update, or whose snapshot predates a committed change to
/// it, becomes rollback-only with [`RollbackReason::Conflict`].
#[derive(Clone)]
pub struct InMemoryStorageEngine {
    state: Arc<EngineState>,
}

impl InMemoryStorageEngine {
    /// Create a new empty engine.
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                committed: RwLock::new(Committed {
                    data: Arc::new(BTreeMap::new()),
                    modified_at: HashMap::new(),
                    version: 0,
                }),
                stores: RwLock::new(HashMap::new()),
                intents: Mutex::new(HashMap::new()),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Number of committed keys across all stores.
    pub fn len(&self) -> usize {
        self.state.committed.read().expect("lock poisoned").data.len()
    }

    /// Returns `true` if no keys have been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed key/value pairs of one store, in key order.
    pub fn entries(&self, store: &Store) -> Vec<(Vec<u8>, Vec<u8>)> {
        let committed = self.state.committed.read().expect("lock poisoned");
        committed
            .data
            .range(store_range(store, None))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of write intents currently held by open transactions.
    pub fn open_intents(&self) -> usize {
        self.state.intents.lock().expect("lock poisoned").len()
    }

    fn start(&self, deadline: Option<Instant>) -> Box<dyn StorageTransaction> {
        let committed = self.state.committed.read().expect("lock poisoned");
        let id = self.state.next_tx.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, version = committed.version, "storage transaction begin");
        Box::new(InMemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            snapshot: Arc::clone(&committed.data),
            snapshot_version: committed.version,
            writes: BTreeMap::new(),
            intents: HashSet::new(),
            deadline,
            rollback: None,
        })
    }
}

impl Default for InMemoryStorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn open_store(&self, name: &str) -> StoreResult<Store> {
        let mut stores = self.state.stores.write().expect("lock poisoned");
        let next_id = stores.len() as u32;
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| Store::new(next_id, name));
        Ok(store.clone())
    }

    fn begin(&self) -> StoreResult<Box<dyn StorageTransaction>> {
        Ok(self.start(None))
    }

    fn begin_timed(&self, timeout: Duration) -> StoreResult<Box<dyn StorageTransaction>> {
        Ok(self.start(Some(Instant::now() + timeout)))
    }
}

impl std::fmt::Debug for InMemoryStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorageEngine")
            .field("key_count", &self.len())
            .finish()
    }
}

fn store_range(store: &Store, after: Option<&[u8]>) -> (Bound<StoreKey>, Bound<StoreKey>) {
    let lower = match after {
        Some(key) => Bound::Excluded((store.id(), key.to_vec())),
        None => Bound::Included((store.id(), Vec::new())),
    };
    let upper = match store.id().checked_add(1) {
        Some(next) => Bound::Excluded((next, Vec::new())),
        None => Bound::Unbounded,
    };
    (lower, upper)
}

/// A transaction against an [`InMemoryStorageEngine`].
pub struct InMemoryTransaction {
    id: u64,
    state: Arc<EngineState>,
    snapshot: Arc<BTreeMap<StoreKey, Vec<u8>>>,
    snapshot_version: u64,
    /// Buffered writes; `None` marks a delete.
    writes: BTreeMap<StoreKey, Option<Vec<u8>>>,
    intents: HashSet<StoreKey>,
    deadline: Option<Instant>,
    rollback: Option<RollbackReason>,
}

impl InMemoryTransaction {
    fn check_live(&mut self) -> StoreResult<()> {
        if let Some(reason) = self.rollback {
            return Err(StoreError::RollbackOnly(reason));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!(tx = self.id, "storage transaction deadline elapsed");
                self.rollback = Some(RollbackReason::Timeout);
                return Err(StoreError::Timeout);
            }
        }
        Ok(())
    }

    fn visible(&self, key: &StoreKey) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(write) => write.clone(),
            None => self.snapshot.get(key).cloned(),
        }
    }

    fn conflict(&mut self, store: &Store, key: &[u8]) -> StoreError {
        debug!(tx = self.id, store = store.name(), key = %hex::encode(key), "write conflict");
        self.rollback = Some(RollbackReason::Conflict);
        StoreError::Conflict {
            store: store.name().to_string(),
            key: hex::encode(key),
        }
    }

    fn acquire_intent(&mut self, store: &Store, key: &[u8]) -> StoreResult<StoreKey> {
        let store_key = (store.id(), key.to_vec());
        if self.intents.contains(&store_key) {
            return Ok(store_key);
        }

        let held_elsewhere = {
            let mut intents = self.state.intents.lock().expect("lock poisoned");
            match intents.get(&store_key) {
                Some(holder) if *holder != self.id => true,
                _ => {
                    intents.insert(store_key.clone(), self.id);
                    false
                }
            }
        };
        if held_elsewhere {
            return Err(self.conflict(store, key));
        }
        self.intents.insert(store_key.clone());

        let changed_since_snapshot = {
            let committed = self.state.committed.read().expect("lock poisoned");
            committed
                .modified_at
                .get(&store_key)
                .is_some_and(|version| *version > self.snapshot_version)
        };
        if changed_since_snapshot {
            return Err(self.conflict(store, key));
        }
        Ok(store_key)
    }

    fn release_intents(&mut self) {
        if self.intents.is_empty() {
            return;
        }
        let mut intents = self.state.intents.lock().expect("lock poisoned");
        for key in self.intents.drain() {
            if intents.get(&key) == Some(&self.id) {
                intents.remove(&key);
            }
        }
    }
}

impl StorageTransaction for InMemoryTransaction {
    fn get(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        Ok(self.visible(&(store.id(), key.to_vec())))
    }

    fn get_for_update(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        let store_key = self.acquire_intent(store, key)?;
        Ok(self.visible(&store_key))
    }

    fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_live()?;
        let store_key = self.acquire_intent(store, key)?;
        self.writes.insert(store_key, Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, store: &Store, key: &[u8]) -> StoreResult<bool> {
        self.check_live()?;
        let store_key = self.acquire_intent(store, key)?;
        let existed = self.visible(&store_key).is_some();
        self.writes.insert(store_key, None);
        Ok(existed)
    }

    fn next_key(&mut self, store: &Store, key: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        let range = store_range(store, key);

        let from_snapshot = self
            .snapshot
            .range(range.clone())
            .map(|(k, _)| k)
            .find(|k| !matches!(self.writes.get(*k), Some(None)));
        let from_writes = self
            .writes
            .range(range)
            .find(|(_, v)| v.is_some())
            .map(|(k, _)| k);

        let next = match (from_snapshot, from_writes) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(next.map(|(_, k)| k.clone()))
    }

    fn prepare(&mut self) -> StoreResult<()> {
        self.check_live()
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.check_live()?;
        let writes = std::mem::take(&mut self.writes);
        if !writes.is_empty() {
            let mut committed = self.state.committed.write().expect("lock poisoned");
            committed.version += 1;
            let version = committed.version;
            let data = Arc::make_mut(&mut committed.data);
            let mut touched = Vec::with_capacity(writes.len());
            for (key, write) in writes {
                match write {
                    Some(value) => {
                        data.insert(key.clone(), value);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
                touched.push(key);
            }
            for key in touched {
                committed.modified_at.insert(key, version);
            }
            trace!(tx = self.id, version, "storage transaction committed");
        }
        self.release_intents();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        trace!(tx = self.id, "storage transaction rolled back");
        self.writes.clear();
        self.release_intents();
    }

    fn mark_rollback(&mut self, reason: RollbackReason) {
        self.rollback.get_or_insert(reason);
    }

    fn rollback_reason(&self) -> Option<RollbackReason> {
        self.rollback
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release_intents();
    }
}
