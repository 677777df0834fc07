use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use keystone_oids::BlockCursor;
use keystone_storage::{AppStores, RollbackReason, StorageTransaction, StoreError, StoreResult};
use keystone_types::{Oid, OidBlock};
use tracing::{debug, trace, warn};

use crate::context::DataContext;
use crate::error::{DataError, DataResult};
use crate::event::DataEvent;
use crate::reference::{ManagedRef, ManagedReference, ReferenceState};
use crate::serialization::Serialization;

/// Work that may only happen once the transaction has committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SideEffect {
    /// Hand the durable task whose handle is stored at `handle` to the
    /// scheduler, to run no earlier than `target`.
    SubmitTask { handle: Oid, target: DateTime<Utc> },
}

/// One unit of work against an application's managed objects.
///
/// The transaction owns its reference table: at most one managed reference
/// per oid, each caching the deserialized object. Objects are loaded lazily on
/// [`Transaction::dereference`] and written back only when the transaction
/// commits. Every cached payload is finalized when the transaction ends,
/// whichever way it ends.
pub struct Transaction<'a> {
    ctx: &'a DataContext,
    storage: Option<Box<dyn StorageTransaction>>,
    references: BTreeMap<Oid, ManagedReference>,
    cursor: Option<BlockCursor>,
    used_blocks: Vec<OidBlock>,
    effects: Vec<SideEffect>,
    deadline: Option<Instant>,
    rollback: Option<RollbackReason>,
    prepared: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(ctx: &'a DataContext) -> DataResult<Self> {
        let timeout = ctx.config().transaction_timeout();
        let storage = match timeout {
            Some(timeout) => ctx.engine().begin_timed(timeout)?,
            None => ctx.engine().begin()?,
        };
        Ok(Self {
            ctx,
            storage: Some(storage),
            references: BTreeMap::new(),
            cursor: None,
            used_blocks: Vec::new(),
            effects: Vec::new(),
            deadline: timeout.map(|t| Instant::now() + t),
            rollback: None,
            prepared: false,
        })
    }

    pub fn context(&self) -> &'a DataContext {
        self.ctx
    }

    pub fn app(&self) -> &str {
        self.ctx.app()
    }

    // -- Lifecycle state --

    pub fn rollback_reason(&self) -> Option<RollbackReason> {
        self.rollback
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback.is_some()
    }

    /// Doom the transaction. The first reason recorded wins.
    pub fn set_rollback_only(&mut self, reason: RollbackReason) {
        if self.rollback.is_none() {
            debug!(app = self.ctx.app(), %reason, "transaction marked rollback-only");
            self.rollback = Some(reason);
        }
        if let Some(storage) = self.storage.as_mut() {
            storage.mark_rollback(reason);
        }
    }

    fn check_live(&mut self) -> DataResult<()> {
        if let Some(reason) = self.rollback {
            return Err(DataError::RollbackOnly(reason));
        }
        if self.storage.is_none() {
            return Err(DataError::TransactionClosed);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.set_rollback_only(RollbackReason::Timeout);
            return Err(DataError::Timeout);
        }
        Ok(())
    }

    /// Run one storage call, adopting the storage transaction's rollback
    /// reason if the call dooms it.
    fn with_storage<R>(
        &mut self,
        op: impl FnOnce(&mut Box<dyn StorageTransaction>, &AppStores) -> StoreResult<R>,
    ) -> DataResult<R> {
        self.check_live()?;
        let ctx = self.ctx;
        let storage = self.storage.as_mut().ok_or(DataError::TransactionClosed)?;
        match op(storage, ctx.stores()) {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Some(reason) = storage.rollback_reason() {
                    if self.rollback.is_none() {
                        self.rollback = Some(reason);
                    }
                }
                Err(e.into())
            }
        }
    }

    // -- Oid allocation --

    fn next_oid(&mut self) -> DataResult<Oid> {
        loop {
            if let Some(cursor) = self.cursor.as_mut() {
                if let Some(oid) = cursor.next_oid() {
                    return Ok(oid);
                }
                self.used_blocks.push(cursor.block());
                self.cursor = None;
            }
            let block = self.ctx.allocator().reserve()?;
            trace!(app = self.ctx.app(), start = %block.start, size = block.size, "transaction took oid block");
            self.cursor = Some(BlockCursor::new(block));
        }
    }

    /// Blocks this transaction has drawn to exhaustion.
    pub fn used_blocks(&self) -> &[OidBlock] {
        &self.used_blocks
    }

    // -- Reference table --

    /// Start managing `object` under a fresh oid, using the serialization
    /// registered for `T`.
    pub fn create_reference<T: Any + Send>(&mut self, object: T) -> DataResult<ManagedRef<T>> {
        let serialization = self.ctx.registry().for_type::<T>()?;
        self.insert_new(serialization, object)
    }

    /// Start managing `object` with a serialization chosen by name.
    pub fn create_reference_with<T: Any + Send>(
        &mut self,
        serialization: &str,
        object: T,
    ) -> DataResult<ManagedRef<T>> {
        let serialization = self.ctx.registry().get(serialization)?;
        if !serialization.accepts(&object) {
            return Err(DataError::Serialization(format!(
                "{} cannot encode {}",
                serialization.name(),
                type_name::<T>()
            )));
        }
        self.insert_new(serialization, object)
    }

    fn insert_new<T: Any + Send>(
        &mut self,
        serialization: Arc<dyn Serialization>,
        object: T,
    ) -> DataResult<ManagedRef<T>> {
        self.check_live()?;
        let oid = self.next_oid()?;
        trace!(app = self.ctx.app(), %oid, "created managed reference");
        self.references
            .insert(oid, ManagedReference::new_object(Box::new(object), serialization));
        Ok(ManagedRef::from_oid(oid))
    }

    /// A reference to the object stored under `oid`. Nothing is loaded yet.
    pub fn reference_to_oid<T: Any + Send>(&mut self, oid: Oid) -> DataResult<ManagedRef<T>> {
        self.ensure_entry::<T>(oid)?;
        Ok(ManagedRef::from_oid(oid))
    }

    /// Like [`Transaction::reference_to_oid`], with a serialization chosen by
    /// name. Used when the type is only known at runtime.
    pub fn reference_to_oid_with<T: Any + Send>(
        &mut self,
        serialization: &str,
        oid: Oid,
    ) -> DataResult<ManagedRef<T>> {
        self.ensure_entry_with(serialization, oid)?;
        Ok(ManagedRef::from_oid(oid))
    }

    fn ensure_entry<T: 'static>(&mut self, oid: Oid) -> DataResult<()> {
        if !self.references.contains_key(&oid) {
            let serialization = self.ctx.registry().for_type::<T>()?;
            self.references.insert(oid, ManagedReference::empty(serialization));
        }
        Ok(())
    }

    fn ensure_entry_with(&mut self, serialization: &str, oid: Oid) -> DataResult<()> {
        if !self.references.contains_key(&oid) {
            let serialization = self.ctx.registry().get(serialization)?;
            self.references.insert(oid, ManagedReference::empty(serialization));
        }
        Ok(())
    }

    /// Lifecycle state of `oid` in this transaction, if it is managed here.
    pub fn state_of(&self, oid: Oid) -> Option<ReferenceState> {
        self.references.get(&oid).map(|r| r.state)
    }

    fn state(&self, oid: Oid) -> DataResult<ReferenceState> {
        self.state_of(oid).ok_or(DataError::NotFound(oid))
    }

    /// Load the payload for `oid` if it is not cached yet.
    fn load<T: 'static>(&mut self, oid: Oid) -> DataResult<()> {
        self.ensure_entry::<T>(oid)?;
        match self.state(oid)? {
            ReferenceState::RemovedEmpty | ReferenceState::RemovedFetched => {
                Err(DataError::ObjectRemoved(oid))
            }
            ReferenceState::Empty => self.fetch(oid),
            ReferenceState::New | ReferenceState::NotModified | ReferenceState::Modified => Ok(()),
        }
    }

    fn fetch(&mut self, oid: Oid) -> DataResult<()> {
        let key = oid.to_key();
        let bytes = self
            .with_storage(|tx, stores| tx.get(&stores.oids, &key))?
            .ok_or(DataError::NotFound(oid))?;
        self.ctx.emit(DataEvent::BytesRead {
            app: self.ctx.app().to_string(),
            bytes: bytes.len(),
        });
        trace!(app = self.ctx.app(), %oid, bytes = bytes.len(), "loaded managed object");

        let reference = self.references.get_mut(&oid).ok_or(DataError::NotFound(oid))?;
        reference.object = Some(reference.serialization.deserialize(&bytes)?);
        reference.state = ReferenceState::NotModified;
        Ok(())
    }

    /// Borrow the object behind `r`, loading it on first use.
    pub fn dereference<T: Any + Send>(&mut self, r: ManagedRef<T>) -> DataResult<&T> {
        let oid = r.oid();
        self.load::<T>(oid)?;
        self.references
            .get(&oid)
            .and_then(|reference| reference.object.as_ref())
            .and_then(|object| object.downcast_ref::<T>())
            .ok_or(DataError::TypeMismatch {
                oid,
                expected: type_name::<T>(),
            })
    }

    /// Mark `r` for write and borrow it mutably.
    pub fn dereference_mut<T: Any + Send>(&mut self, r: ManagedRef<T>) -> DataResult<&mut T> {
        let oid = r.oid();
        self.mark(r)?;
        self.references
            .get_mut(&oid)
            .and_then(|reference| reference.object.as_mut())
            .and_then(|object| object.downcast_mut::<T>())
            .ok_or(DataError::TypeMismatch {
                oid,
                expected: type_name::<T>(),
            })
    }

    /// Record intent to write `r`.
    ///
    /// The first mark of a loaded object takes a storage write intent, so a
    /// concurrent writer of the same object is detected here rather than at
    /// commit.
    pub fn mark<T: Any + Send>(&mut self, r: ManagedRef<T>) -> DataResult<()> {
        let oid = r.oid();
        self.load::<T>(oid)?;
        match self.state(oid)? {
            ReferenceState::New | ReferenceState::Modified => Ok(()),
            ReferenceState::NotModified => {
                let key = oid.to_key();
                self.with_storage(|tx, stores| tx.get_for_update(&stores.oids, &key))?;
                if let Some(reference) = self.references.get_mut(&oid) {
                    reference.state = ReferenceState::Modified;
                }
                Ok(())
            }
            ReferenceState::Empty => Err(DataError::NotFound(oid)),
            ReferenceState::RemovedEmpty | ReferenceState::RemovedFetched => {
                Err(DataError::ObjectRemoved(oid))
            }
        }
    }

    /// Delete the object behind `r`. Removing twice is a no-op.
    pub fn remove<T: Any + Send>(&mut self, r: ManagedRef<T>) -> DataResult<()> {
        self.check_live()?;
        self.ensure_entry::<T>(r.oid())?;
        self.remove_entry(r.oid())
    }

    /// Delete the object stored under `oid` when its type is only known by
    /// serialization name.
    pub fn remove_with(&mut self, serialization: &str, oid: Oid) -> DataResult<()> {
        self.check_live()?;
        self.ensure_entry_with(serialization, oid)?;
        self.remove_entry(oid)
    }

    fn remove_entry(&mut self, oid: Oid) -> DataResult<()> {
        let next = match self.state(oid)? {
            ReferenceState::RemovedEmpty | ReferenceState::RemovedFetched => return Ok(()),
            ReferenceState::New => ReferenceState::RemovedFetched,
            state => {
                let key = oid.to_key();
                self.with_storage(|tx, stores| tx.delete(&stores.oids, &key))?;
                if state == ReferenceState::Empty {
                    ReferenceState::RemovedEmpty
                } else {
                    ReferenceState::RemovedFetched
                }
            }
        };
        if let Some(reference) = self.references.get_mut(&oid) {
            reference.state = next;
        }
        trace!(app = self.ctx.app(), %oid, state = ?next, "removed managed object");
        Ok(())
    }

    // -- Bindings --

    /// The oid bound to `name`, if any.
    pub fn get_binding_oid(&mut self, name: &str) -> DataResult<Option<Oid>> {
        let value = self.with_storage(|tx, stores| tx.get(&stores.names, name.as_bytes()))?;
        value
            .map(|bytes| {
                Oid::from_key(&bytes).map_err(|e| {
                    DataError::Storage(StoreError::Corrupt {
                        store: self.ctx.stores().names.name().to_string(),
                        key: name.to_string(),
                        reason: e.to_string(),
                    })
                })
            })
            .transpose()
    }

    /// A reference to the object bound to `name`, if any.
    pub fn get_binding<T: Any + Send>(&mut self, name: &str) -> DataResult<Option<ManagedRef<T>>> {
        match self.get_binding_oid(name)? {
            Some(oid) => self.reference_to_oid(oid).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_binding<T>(&mut self, name: &str, r: ManagedRef<T>) -> DataResult<()> {
        self.set_binding_to_oid(name, r.oid())
    }

    pub fn set_binding_to_oid(&mut self, name: &str, oid: Oid) -> DataResult<()> {
        let value = oid.to_key();
        self.with_storage(|tx, stores| tx.put(&stores.names, name.as_bytes(), &value))
    }

    /// Remove the binding `name`. The bound object is left alone.
    pub fn remove_binding(&mut self, name: &str) -> DataResult<()> {
        let existed = self.with_storage(|tx, stores| tx.delete(&stores.names, name.as_bytes()))?;
        if !existed {
            return Err(DataError::BindingNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn binding_exists(&mut self, name: &str) -> DataResult<bool> {
        Ok(self
            .with_storage(|tx, stores| tx.get(&stores.names, name.as_bytes()))?
            .is_some())
    }

    /// The binding name that sorts directly after `name` (or the first one).
    pub fn next_binding(&mut self, name: Option<&str>) -> DataResult<Option<String>> {
        let key = self.with_storage(|tx, stores| tx.next_key(&stores.names, name.map(str::as_bytes)))?;
        key.map(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                DataError::Storage(StoreError::Corrupt {
                    store: self.ctx.stores().names.name().to_string(),
                    key: hex::encode(e.as_bytes()),
                    reason: "binding name is not UTF-8".to_string(),
                })
            })
        })
        .transpose()
    }

    // -- Side effects --

    /// Queue work to run after a successful commit.
    pub fn defer(&mut self, effect: SideEffect) -> DataResult<()> {
        self.check_live()?;
        self.effects.push(effect);
        Ok(())
    }

    pub fn pending_effects(&self) -> &[SideEffect] {
        &self.effects
    }

    // -- Commit protocol --

    /// Flush new and modified objects and prepare the storage transaction.
    ///
    /// Fails without writing anything further once the transaction is
    /// rollback-only. Calling it again after success does nothing.
    pub fn prepare(&mut self) -> DataResult<()> {
        if self.prepared {
            return Ok(());
        }
        self.check_live()?;

        let mut writes = Vec::new();
        let mut failure = None;
        for (oid, reference) in &self.references {
            if !reference.state.needs_flush() {
                continue;
            }
            let object = reference.object.as_deref().ok_or(DataError::NotFound(*oid))?;
            let mut bytes = Vec::new();
            match reference.serialization.serialize(object, &mut bytes) {
                Ok(()) => writes.push((*oid, bytes)),
                Err(e) => {
                    failure = Some((*oid, e));
                    break;
                }
            }
        }
        if let Some((oid, e)) = failure {
            warn!(app = self.ctx.app(), %oid, error = %e, "failed to serialize managed object");
            self.set_rollback_only(RollbackReason::Aborted);
            return Err(e);
        }

        let flushed = writes.len();
        for (oid, bytes) in writes {
            let key = oid.to_key();
            self.with_storage(|tx, stores| tx.put(&stores.oids, &key, &bytes))?;
            self.ctx.emit(DataEvent::BytesWritten {
                app: self.ctx.app().to_string(),
                bytes: bytes.len(),
            });
        }

        self.with_storage(|tx, _| tx.prepare())?;
        self.prepared = true;
        debug!(app = self.ctx.app(), flushed, "prepared transaction");
        Ok(())
    }

    /// Commit, returning the side effects queued during the transaction.
    ///
    /// On failure the transaction is rolled back and its effects discarded.
    pub fn commit(mut self) -> DataResult<Vec<SideEffect>> {
        if let Err(e) = self.prepare() {
            self.abort();
            return Err(e);
        }
        let storage = self.storage.take().ok_or(DataError::TransactionClosed)?;
        let result = storage.commit();
        self.finalize_all();
        result?;
        Ok(std::mem::take(&mut self.effects))
    }

    /// Discard every write and queued effect.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(storage) = self.storage.take() {
            storage.rollback();
        }
        self.finalize_all();
        self.effects.clear();
    }

    fn finalize_all(&mut self) {
        for reference in self.references.values_mut() {
            reference.finalize();
        }
        self.references.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("app", &self.ctx.app())
            .field("references", &self.references.len())
            .field("rollback", &self.rollback)
            .field("prepared", &self.prepared)
            .finish()
    }
}
