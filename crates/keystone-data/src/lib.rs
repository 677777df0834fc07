//! Transactional managed-object storage for Keystone.
//!
//! Application code works with typed [`ManagedRef`] handles inside a
//! [`Transaction`]. Each transaction owns a reference table: an identity map
//! from oid to a managed reference that caches the deserialized object and
//! tracks its lifecycle ([`ReferenceState`]). Nothing is written until commit,
//! when new and modified objects are serialized and flushed through the
//! storage engine in a single prepare step.
//!
//! # Modules
//!
//! - [`serialization`]: name-keyed serialize/deserialize/finalize strategies
//! - [`reference`]: managed reference states and typed handles
//! - [`context`]: per-application wiring: engine, stores, allocator, registry
//! - [`transaction`]: the reference table and its commit/rollback protocol
//! - [`runner`]: whole-transaction retry around a transactional closure
//! - [`event`]: byte-count events for observability

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod reference;
pub mod runner;
pub mod serialization;
pub mod transaction;

pub use config::DataConfig;
pub use context::DataContext;
pub use error::{DataError, DataResult};
pub use event::DataEvent;
pub use reference::{ManagedRef, ReferenceState};
pub use runner::{run_transaction, TxOutcome};
pub use serialization::{BincodeSerialization, Serialization, SerializationRegistry};
pub use transaction::{SideEffect, Transaction};
