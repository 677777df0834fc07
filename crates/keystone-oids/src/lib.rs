//! Object identifier allocation for Keystone.
//!
//! Oids are reserved in blocks: one durable counter update hands out a whole
//! range `[start, start + size)`, and callers then draw ids from the block
//! without touching storage.
//!
//! - [`OidAllocationStrategy`] -- where blocks come from. [`StorageOidStrategy`]
//!   advances a counter in the application's `meta` store; distributed nodes
//!   use a strategy that asks the coordination server instead.
//! - [`OidAllocator`] -- the process-wide block cache shared by all
//!   transactions of an application.
//! - [`BlockCursor`] -- sequential draw from a single block.

pub mod allocator;
pub mod error;
pub mod storage;
pub mod strategy;

pub use allocator::{BlockCursor, OidAllocator};
pub use error::{OidError, OidResult};
pub use storage::{StorageOidStrategy, DEFAULT_BLOCK_SIZE};
pub use strategy::OidAllocationStrategy;
