use keystone_oids::OidError;
use keystone_storage::{RollbackReason, StoreError};
use keystone_types::Oid;

/// Errors produced by the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A storage operation failed; the transaction may now be rollback-only.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Oid allocation failed. Always fatal to the operation.
    #[error("oid allocation failed: {0}")]
    Oids(#[from] OidError),

    /// No object is stored under the oid.
    #[error("object not found: {0}")]
    NotFound(Oid),

    /// The object was removed earlier in this transaction.
    #[error("object removed: {0}")]
    ObjectRemoved(Oid),

    #[error("binding not found: {0}")]
    BindingNotFound(String),

    #[error("unknown serialization: {0}")]
    UnknownSerialization(String),

    #[error("serialization already registered: {0}")]
    DuplicateSerialization(String),

    /// No serialization is registered for the Rust type.
    #[error("no serialization registered for type {0}")]
    UnregisteredType(&'static str),

    /// The cached object is not of the requested type.
    #[error("type mismatch for {oid}: expected {expected}")]
    TypeMismatch { oid: Oid, expected: &'static str },

    /// Encoding or decoding a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transaction was marked rollback-only; nothing more can be done in it.
    #[error("transaction is rollback-only ({0})")]
    RollbackOnly(RollbackReason),

    /// The transaction's deadline elapsed.
    #[error("transaction timed out")]
    Timeout,

    /// The transaction has already committed or rolled back.
    #[error("transaction is closed")]
    TransactionClosed,

    /// Application code aborted the transaction.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl DataError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::RollbackOnly(reason) => reason.is_retryable(),
            Self::Timeout => true,
            _ => false,
        }
    }
}

/// Result alias for data operations.
pub type DataResult<T> = Result<T, DataError>;
