use std::fmt;

/// Why a storage transaction became rollback-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackReason {
    /// Another transaction holds or has committed a conflicting write.
    Conflict,
    /// The transaction's deadline elapsed.
    Timeout,
    /// The caller asked for the rollback.
    Aborted,
}

impl RollbackReason {
    /// Conflicts and timeouts are resolved by retrying the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout)
    }
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => f.write_str("conflict"),
            Self::Timeout => f.write_str("timeout"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Errors from storage engine operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write intent on the key is held by another transaction, or the key
    /// changed after this transaction's snapshot was taken.
    #[error("write conflict on {store}/{key}")]
    Conflict { store: String, key: String },

    /// The transaction's deadline elapsed before the operation started.
    #[error("transaction timed out")]
    Timeout,

    /// The transaction was already marked rollback-only.
    #[error("transaction is rollback-only ({0})")]
    RollbackOnly(RollbackReason),

    /// The named store has not been opened on this engine.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// The stored data is malformed or cannot be decoded.
    #[error("corrupt value at {store}/{key}: {reason}")]
    Corrupt {
        store: String,
        key: String,
        reason: String,
    },

    /// The backing service failed or does not serve the operation.
    #[error("remote storage error: {0}")]
    Remote(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Timeout => true,
            Self::RollbackOnly(reason) => reason.is_retryable(),
            Self::UnknownStore(_) | Self::Corrupt { .. } | Self::Remote(_) => false,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
