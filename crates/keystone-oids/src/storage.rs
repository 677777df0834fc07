use std::sync::{Arc, Mutex};

use keystone_storage::{StorageEngine, Store, StoreError, NEXT_OID_KEY};
use keystone_types::{Oid, OidBlock};
use tracing::debug;

use crate::error::{OidError, OidResult};
use crate::strategy::OidAllocationStrategy;

/// Number of oids handed out per reservation.
pub const DEFAULT_BLOCK_SIZE: u64 = 100;

/// Allocation strategy backed by a counter in an application's `meta` store.
///
/// Each reservation runs in its own short-lived storage transaction: it reads
/// the counter for update, writes `counter + block_size`, and commits before the
/// block `[counter, counter + block_size)` is returned. A crash after the commit
/// at worst leaks the block; it can never be issued again.
pub struct StorageOidStrategy {
    engine: Arc<dyn StorageEngine>,
    meta: Store,
    block_size: u64,
    lock: Mutex<()>,
}

impl StorageOidStrategy {
    pub fn new(engine: Arc<dyn StorageEngine>, meta: Store) -> Self {
        Self::with_block_size(engine, meta, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(engine: Arc<dyn StorageEngine>, meta: Store, block_size: u64) -> Self {
        Self {
            engine,
            meta,
            block_size: block_size.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The persisted next-oid counter (0 if no block was ever reserved).
    pub fn current_counter(&self) -> OidResult<u64> {
        let mut tx = self.engine.begin()?;
        let value = tx.get(&self.meta, NEXT_OID_KEY)?;
        tx.rollback();
        value.map_or(Ok(0), |bytes| decode_counter(&bytes))
    }
}

pub(crate) fn decode_counter(bytes: &[u8]) -> OidResult<u64> {
    Oid::from_key(bytes)
        .map(|oid| oid.value())
        .map_err(|e| OidError::CorruptCounter(e.to_string()))
}

impl OidAllocationStrategy for StorageOidStrategy {
    fn reserve_block(&self) -> OidResult<OidBlock> {
        let _guard = self.lock.lock().expect("lock poisoned");
        let mut tx = self.engine.begin()?;

        let current = match tx.get_for_update(&self.meta, NEXT_OID_KEY) {
            Ok(Some(bytes)) => decode_counter(&bytes),
            Ok(None) => Ok(0),
            Err(e) => Err(e.into()),
        };
        let current = match current {
            Ok(current) => current,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };

        let Some(next) = current.checked_add(self.block_size) else {
            tx.rollback();
            return Err(OidError::Exhausted(current));
        };

        let result: Result<(), StoreError> = tx
            .put(&self.meta, NEXT_OID_KEY, &Oid::new(next).to_key())
            .and_then(|()| tx.prepare());
        if let Err(e) = result {
            tx.rollback();
            return Err(e.into());
        }
        tx.commit()?;

        debug!(start = current, next, "reserved oid block");
        OidBlock::new(Oid::new(current), self.block_size)
            .map_err(|_| OidError::Exhausted(current))
    }
}
