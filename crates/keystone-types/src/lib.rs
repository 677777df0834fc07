//! Foundation types for Keystone.
//!
//! This crate provides the identifier and mutation types shared by every other
//! Keystone crate: the storage layer keys records by [`Oid`], the allocator hands
//! out [`OidBlock`]s, the coordination server scopes locks by [`NodeId`], and
//! committed node-local transactions travel as [`Changeset`]s.
//!
//! # Key Types
//!
//! - [`Oid`]: 64-bit object identifier with a fixed-width big-endian key encoding
//! - [`OidBlock`]: a reserved, never-reused range of oids
//! - [`NodeId`]: ephemeral identity of a connected game-server node
//! - [`Identity`]: the authenticated principal that owns a task
//! - [`Changeset`]: ordered object and binding mutations from one transaction

pub mod block;
pub mod changeset;
pub mod error;
pub mod identity;
pub mod oid;

pub use block::OidBlock;
pub use changeset::{BindingChange, Changeset, ObjectChange};
pub use error::TypeError;
pub use identity::{Identity, NodeId};
pub use oid::{Oid, OID_KEY_LEN};
