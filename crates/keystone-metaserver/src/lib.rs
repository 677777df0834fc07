//! Keystone metaserver.
//!
//! Holds the canonical object and binding stores for every application,
//! hands out oid blocks, and arbitrates read/write locks across connected
//! nodes. Lock requests never block: conflicts are answered with a denial and
//! the node retries its transaction. When a node disconnects every lock it
//! held is released.
//!
//! Key types:
//! - [`DataServer`]: stores, locks, and the connected-node registry
//! - [`LockTable`]: shared/exclusive key locks and binding range locks
//! - [`ClientSession`]: per-connection request dispatch
//! - [`MetaServer`]: tokio accept loop plus the axum admin surface

pub mod config;
pub mod dataserver;
pub mod error;
pub mod handler;
pub mod locks;
pub mod router;
pub mod server;
pub mod session;

pub use config::MetaServerConfig;
pub use dataserver::{DataServer, NodeSummary};
pub use error::{ServerError, ServerResult};
pub use locks::{LockKey, LockMode, LockTable};
pub use server::{serve_connection, MetaServer};
pub use session::ClientSession;
