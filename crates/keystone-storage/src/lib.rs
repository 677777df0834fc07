//! Transactional key-value storage for Keystone.
//!
//! The persistence core never talks to a concrete database directly. It drives
//! a [`StorageEngine`] through per-transaction [`StorageTransaction`] handles
//! that provide:
//!
//! - snapshot isolation: a transaction never observes another transaction's
//!   uncommitted writes, nor writes committed after it began;
//! - conflict detection: [`StorageTransaction::get_for_update`] and every write
//!   take a per-key write intent, and a conflicting intent marks the transaction
//!   rollback-only with a retryable reason instead of blocking;
//! - ordered scans via [`StorageTransaction::next_key`];
//! - optional wall-clock deadlines via [`StorageEngine::begin_timed`].
//!
//! # Storage Backends
//!
//! - [`InMemoryStorageEngine`] -- `BTreeMap`-based engine for tests, the
//!   coordination server, and embedding
//!
//! # Store layout
//!
//! Each application owns an [`AppStores`] triple: `names` (binding name to
//! encoded oid), `oids` (encoded oid to serialized payload), and `meta` (a single
//! fixed key holding the next-oid counter).

pub mod error;
pub mod memory;
pub mod stores;
pub mod traits;

pub use error::{RollbackReason, StoreError, StoreResult};
pub use memory::InMemoryStorageEngine;
pub use stores::{AppStores, NEXT_OID_KEY};
pub use traits::{StorageEngine, StorageTransaction, Store};
