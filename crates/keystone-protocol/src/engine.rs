use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use keystone_data::{DataConfig, DataContext, DataResult, SerializationRegistry};
use keystone_oids::OidAllocator;
use keystone_storage::{RollbackReason, StorageEngine, StorageTransaction, Store, StoreError, StoreResult};
use keystone_types::{Changeset, Oid};
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::message::DataOutcome;
use crate::remote::{BlockingDataClient, RemoteOidStrategy};

/// The canonical keyspace a store name maps to.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Keyspace {
    Objects(String),
    Bindings(String),
    /// Opened on the node but not served by the metaserver.
    Unserved,
}

impl Keyspace {
    fn of(store: &Store) -> Self {
        match store.name().rsplit_once('.') {
            Some((app, "oids")) => Self::Objects(app.to_string()),
            Some((app, "names")) => Self::Bindings(app.to_string()),
            _ => Self::Unserved,
        }
    }
}

/// A metaserver lock held on behalf of local transactions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LockedKey {
    Object(String, Oid),
    Binding(String, String),
}

#[derive(Debug, Default)]
struct Holders {
    readers: HashSet<u64>,
    writer: Option<u64>,
}

impl Holders {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeldRange {
    tx: u64,
    app: String,
    from: Option<String>,
    to: Option<String>,
}

fn range_covers(from: Option<&str>, to: Option<&str>, name: &str) -> bool {
    from.map_or(true, |from| name > from) && to.map_or(true, |to| name <= to)
}

/// Metaserver locks taken by this node's transactions.
///
/// The metaserver scopes locks to the connection, which every local
/// transaction shares, so conflicts between local transactions are decided
/// here with the same rules. A key is released remotely once no local
/// transaction holds it.
#[derive(Debug, Default)]
struct NodeLocks {
    keys: HashMap<LockedKey, Holders>,
    ranges: Vec<HeldRange>,
}

impl NodeLocks {
    fn can_take(&self, tx: u64, key: &LockedKey, write: bool) -> bool {
        if let Some(holders) = self.keys.get(key) {
            if holders.writer.is_some_and(|writer| writer != tx) {
                return false;
            }
            if write && holders.readers.iter().any(|reader| *reader != tx) {
                return false;
            }
        }
        match (write, key) {
            (true, LockedKey::Binding(app, name)) => !self
                .ranges
                .iter()
                .any(|range| range.tx != tx && range.app == *app && range_covers(range.from.as_deref(), range.to.as_deref(), name)),
            _ => true,
        }
    }

    fn take(&mut self, tx: u64, key: LockedKey, write: bool) {
        let holders = self.keys.entry(key).or_default();
        if write {
            holders.writer = Some(tx);
        } else if holders.writer != Some(tx) {
            holders.readers.insert(tx);
        }
    }

    fn can_take_range(&self, tx: u64, app: &str, from: Option<&str>, to: Option<&str>) -> bool {
        !self.keys.iter().any(|(key, holders)| {
            holders.writer.is_some_and(|writer| writer != tx)
                && matches!(key, LockedKey::Binding(key_app, name) if key_app == app && range_covers(from, to, name))
        })
    }

    fn take_range(&mut self, range: HeldRange) {
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
    }

    /// Forget everything `tx` holds. Returns the keys no local transaction
    /// holds any more, and the apps left without any local range lock.
    fn release_tx(&mut self, tx: u64) -> (Vec<LockedKey>, Vec<String>) {
        let mut freed = Vec::new();
        self.keys.retain(|key, holders| {
            let was_reader = holders.readers.remove(&tx);
            let was_writer = holders.writer == Some(tx);
            if was_writer {
                holders.writer = None;
            }
            if holders.is_empty() {
                if was_reader || was_writer {
                    freed.push(key.clone());
                }
                return false;
            }
            true
        });

        let apps: BTreeSet<String> = self
            .ranges
            .iter()
            .filter(|range| range.tx == tx)
            .map(|range| range.app.clone())
            .collect();
        self.ranges.retain(|range| range.tx != tx);
        let idle_apps = apps
            .into_iter()
            .filter(|app| !self.ranges.iter().any(|range| range.app == *app))
            .collect();
        (freed, idle_apps)
    }

    fn len(&self) -> usize {
        self.keys.len() + self.ranges.len()
    }
}

struct Shared {
    client: Arc<BlockingDataClient>,
    locks: Mutex<NodeLocks>,
}

/// Storage engine for a node that shares the metaserver's canonical store.
///
/// Reads go to the metaserver under a read lock and writes take a write lock
/// before they are buffered; the buffered writes are submitted as one
/// changeset at commit. A denied lock or a rejected changeset leaves the
/// transaction rollback-only with [`RollbackReason::Conflict`], so the
/// caller's retry loop runs it again. Every lock the transaction took is
/// released when it ends, whichever way it ends.
///
/// Only the `names` and `oids` stores are served. Oid blocks come from the
/// metaserver too; see [`RemoteStorageEngine::open_context`].
pub struct RemoteStorageEngine {
    shared: Arc<Shared>,
    stores: RwLock<HashMap<String, Store>>,
    next_tx: AtomicU64,
}

impl RemoteStorageEngine {
    pub fn new(client: Arc<BlockingDataClient>) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                locks: Mutex::new(NodeLocks::default()),
            }),
            stores: RwLock::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &Arc<BlockingDataClient> {
        &self.shared.client
    }

    /// Keys and ranges currently locked on the metaserver for this node.
    pub fn held_locks(&self) -> usize {
        self.shared.locks.lock().expect("lock poisoned").len()
    }

    /// Open `app` on this engine with an oid allocator fed by the
    /// metaserver.
    pub fn open_context(
        self: Arc<Self>,
        app: &str,
        registry: Arc<SerializationRegistry>,
        config: DataConfig,
    ) -> DataResult<DataContext> {
        let strategy = RemoteOidStrategy::new(self.shared.client.clone(), app);
        let allocator = Arc::new(OidAllocator::new(Arc::new(strategy)));
        DataContext::with_allocator(app, self, registry, allocator, config)
    }

    fn start(&self, deadline: Option<Instant>) -> Box<dyn StorageTransaction> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, "remote transaction begin");
        Box::new(RemoteTransaction {
            id,
            shared: Arc::clone(&self.shared),
            entries: BTreeMap::new(),
            deadline,
            rollback: None,
        })
    }
}

impl StorageEngine for RemoteStorageEngine {
    fn open_store(&self, name: &str) -> StoreResult<Store> {
        let mut stores = self.stores.write().expect("lock poisoned");
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

impl std::fmt::Debug for RemoteStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorageEngine")
            .field("held_locks", &self.held_locks())
            .finish()
    }
}

type Slot = (u32, Vec<u8>);

/// A key this transaction has locked, with its current value.
struct Entry {
    store: Store,
    value: Option<Vec<u8>>,
    for_write: bool,
    dirty: bool,
}

/// A transaction against a [`RemoteStorageEngine`].
pub struct RemoteTransaction {
    id: u64,
    shared: Arc<Shared>,
    entries: BTreeMap<Slot, Entry>,
    deadline: Option<Instant>,
    rollback: Option<RollbackReason>,
}

fn corrupt(store: &Store, key: &[u8], reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        store: store.name().to_string(),
        key: hex::encode(key),
        reason: reason.into(),
    }
}

fn slot_range(store: &Store, after: Option<&[u8]>) -> (Bound<Slot>, Bound<Slot>) {
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

impl RemoteTransaction {
    fn check_live(&mut self) -> StoreResult<()> {
        if let Some(reason) = self.rollback {
            return Err(StoreError::RollbackOnly(reason));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!(tx = self.id, "remote transaction deadline elapsed");
                self.rollback = Some(RollbackReason::Timeout);
                return Err(StoreError::Timeout);
            }
        }
        Ok(())
    }

    fn denied(&mut self, store: &str, key: &[u8]) -> StoreError {
        debug!(tx = self.id, store, key = %hex::encode(key), "metaserver lock denied");
        self.rollback = Some(RollbackReason::Conflict);
        StoreError::Conflict {
            store: store.to_string(),
            key: hex::encode(key),
        }
    }

    fn failed(&mut self, e: ProtocolError) -> StoreError {
        warn!(tx = self.id, error = %e, "metaserver request failed");
        self.rollback = Some(RollbackReason::Aborted);
        StoreError::Remote(e.to_string())
    }

    fn locked_key(store: &Store, key: &[u8]) -> StoreResult<LockedKey> {
        match Keyspace::of(store) {
            Keyspace::Objects(app) => {
                let oid = Oid::from_key(key).map_err(|e| corrupt(store, key, e.to_string()))?;
                Ok(LockedKey::Object(app, oid))
            }
            Keyspace::Bindings(app) => {
                let name = std::str::from_utf8(key).map_err(|_| corrupt(store, key, "binding name is not UTF-8"))?;
                Ok(LockedKey::Binding(app, name.to_string()))
            }
            Keyspace::Unserved => Err(StoreError::UnknownStore(store.name().to_string())),
        }
    }

    /// Lock `key` on the metaserver and return its canonical value.
    fn request(&mut self, store: &Store, key: &[u8], write: bool) -> StoreResult<Option<Vec<u8>>> {
        let target = Self::locked_key(store, key)?;
        let shared = Arc::clone(&self.shared);
        let mut locks = shared.locks.lock().expect("lock poisoned");
        if !locks.can_take(self.id, &target, write) {
            return Err(self.denied(store.name(), key));
        }
        let outcome = match &target {
            LockedKey::Object(app, oid) => shared.client.request_object(app, *oid, write),
            LockedKey::Binding(app, name) => shared.client.request_binding(app, name, write),
        };
        match outcome {
            Ok(DataOutcome::Granted(value)) => {
                locks.take(self.id, target, write);
                Ok(value)
            }
            Ok(DataOutcome::Denied { retry_after_ms }) => {
                trace!(tx = self.id, retry_after_ms, "metaserver asked for a retry");
                Err(self.denied(store.name(), key))
            }
            Err(e) => Err(self.failed(e)),
        }
    }

    fn lock_for_write(&mut self, store: &Store, key: &[u8]) -> StoreResult<&mut Entry> {
        let slot = (store.id(), key.to_vec());
        let held = self.entries.get(&slot).is_some_and(|entry| entry.for_write);
        if !held {
            let value = self.request(store, key, true)?;
            let entry = self.entries.entry(slot.clone()).or_insert_with(|| Entry {
                store: store.clone(),
                value: None,
                for_write: false,
                dirty: false,
            });
            entry.value = value;
            entry.for_write = true;
        }
        self.entries
            .get_mut(&slot)
            .ok_or_else(|| StoreError::Remote("write lock lost".into()))
    }

    /// The binding after `after`, range-locking the names in between.
    fn next_remote(&mut self, store: &Store, app: &str, after: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        let from = after
            .map(|key| std::str::from_utf8(key).map_err(|_| corrupt(store, key, "binding name is not UTF-8")))
            .transpose()?;
        let shared = Arc::clone(&self.shared);
        let mut locks = shared.locks.lock().expect("lock poisoned");
        let next = match shared.client.request_next_binding(app, from) {
            Ok(DataOutcome::Granted(next)) => next,
            Ok(DataOutcome::Denied { .. }) => return Err(self.denied(store.name(), after.unwrap_or_default())),
            Err(e) => return Err(self.failed(e)),
        };
        let to = next
            .as_deref()
            .map(|name| std::str::from_utf8(name).map_err(|_| corrupt(store, name, "binding name is not UTF-8")))
            .transpose()?;
        let range = HeldRange {
            tx: self.id,
            app: app.to_string(),
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        };
        let clear = locks.can_take_range(self.id, app, from, to);
        // Held either way so that ending the transaction releases it.
        locks.take_range(range);
        if !clear {
            return Err(self.denied(store.name(), after.unwrap_or_default()));
        }
        Ok(next)
    }

    /// The buffered writes, one changeset per application.
    fn changesets(&self) -> StoreResult<Vec<Changeset>> {
        let mut by_app: BTreeMap<String, Changeset> = BTreeMap::new();
        for ((_, key), entry) in self.entries.iter().filter(|(_, entry)| entry.dirty) {
            match Self::locked_key(&entry.store, key)? {
                LockedKey::Object(app, oid) => {
                    let changeset = by_app.entry(app.clone()).or_insert_with(|| Changeset::new(app));
                    match &entry.value {
                        Some(data) => changeset.write_object(oid, data.clone()),
                        None => changeset.delete_object(oid),
                    };
                }
                LockedKey::Binding(app, name) => {
                    let changeset = by_app.entry(app.clone()).or_insert_with(|| Changeset::new(app));
                    match &entry.value {
                        Some(bytes) => {
                            let oid = Oid::from_key(bytes).map_err(|e| corrupt(&entry.store, key, e.to_string()))?;
                            changeset.bind(name, oid)
                        }
                        None => changeset.unbind(name),
                    };
                }
            }
        }
        Ok(by_app.into_values().collect())
    }

    fn release(&mut self) {
        self.entries.clear();
        let shared = Arc::clone(&self.shared);
        // Held while sending so no local transaction re-takes a key between
        // the bookkeeping and the release reaching the metaserver.
        let mut locks = shared.locks.lock().expect("lock poisoned");
        let (keys, apps) = locks.release_tx(self.id);
        for key in &keys {
            let result = match key {
                LockedKey::Object(app, oid) => shared.client.release_object(app, *oid),
                LockedKey::Binding(app, name) => shared.client.release_binding(app, name),
            };
            if let Err(e) = result {
                debug!(tx = self.id, ?key, error = %e, "lock release not sent");
            }
        }
        for app in &apps {
            if let Err(e) = shared.client.release_binding_range(app, None, None) {
                debug!(tx = self.id, app = %app, error = %e, "range release not sent");
            }
        }
        if !keys.is_empty() || !apps.is_empty() {
            trace!(tx = self.id, keys = keys.len(), ranges = apps.len(), "released metaserver locks");
        }
    }
}

impl StorageTransaction for RemoteTransaction {
    fn get(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        let slot = (store.id(), key.to_vec());
        if let Some(entry) = self.entries.get(&slot) {
            return Ok(entry.value.clone());
        }
        let value = self.request(store, key, false)?;
        self.entries.insert(
            slot,
            Entry {
                store: store.clone(),
                value: value.clone(),
                for_write: false,
                dirty: false,
            },
        );
        Ok(value)
    }

    fn get_for_update(&mut self, store: &Store, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        Ok(self.lock_for_write(store, key)?.value.clone())
    }

    fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_live()?;
        let entry = self.lock_for_write(store, key)?;
        entry.value = Some(value.to_vec());
        entry.dirty = true;
        Ok(())
    }

    fn delete(&mut self, store: &Store, key: &[u8]) -> StoreResult<bool> {
        self.check_live()?;
        let entry = self.lock_for_write(store, key)?;
        let existed = entry.value.take().is_some();
        entry.dirty = true;
        Ok(existed)
    }

    fn next_key(&mut self, store: &Store, key: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        self.check_live()?;
        let Keyspace::Bindings(app) = Keyspace::of(store) else {
            return Err(StoreError::Remote(format!("ordered scans are not served for {}", store.name())));
        };
        let local = self
            .entries
            .range(slot_range(store, key))
            .find(|(_, entry)| entry.dirty && entry.value.is_some())
            .map(|((_, name), _)| name.clone());

        let mut after = key.map(<[u8]>::to_vec);
        let remote = loop {
            let Some(name) = self.next_remote(store, &app, after.as_deref())? else {
                break None;
            };
            let deleted_here = self
                .entries
                .get(&(store.id(), name.clone()))
                .is_some_and(|entry| entry.dirty && entry.value.is_none());
            if !deleted_here {
                break Some(name);
            }
            after = Some(name);
        };
        Ok(match (remote, local) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    fn prepare(&mut self) -> StoreResult<()> {
        self.check_live()?;
        self.changesets().map(|_| ())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.check_live()?;
        for changeset in self.changesets()? {
            if changeset.is_empty() {
                continue;
            }
            match self.shared.client.submit_changeset(&changeset) {
                Ok(true) => debug!(tx = self.id, app = %changeset.app, changes = changeset.len(), "changeset applied"),
                Ok(false) => {
                    warn!(tx = self.id, app = %changeset.app, "metaserver rejected changeset");
                    return Err(self.denied(&changeset.app, &[]));
                }
                Err(e) => return Err(self.failed(e)),
            }
        }
        self.release();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        trace!(tx = self.id, "remote transaction rolled back");
        self.release();
    }

    fn mark_rollback(&mut self, reason: RollbackReason) {
        self.rollback.get_or_insert(reason);
    }

    fn rollback_reason(&self) -> Option<RollbackReason> {
        self.rollback
    }
}

impl Drop for RemoteTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
