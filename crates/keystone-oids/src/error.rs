use keystone_storage::StoreError;

/// Errors from oid allocation.
///
/// Every variant is fatal to the attempted allocation: a failed reservation is
/// never retried silently, so a range can never be skipped or issued twice.
#[derive(Debug, thiserror::Error)]
pub enum OidError {
    /// The reservation transaction could not be created or was rolled back.
    #[error("oid reservation transaction failed: {0}")]
    Transaction(#[from] StoreError),

    /// The persisted counter could not be decoded.
    #[error("corrupt oid counter: {0}")]
    CorruptCounter(String),

    /// The oid space is exhausted.
    #[error("oid space exhausted at {0}")]
    Exhausted(u64),

    /// A remote reservation failed.
    #[error("remote oid reservation failed: {0}")]
    Remote(String),
}

/// Result alias for allocation operations.
pub type OidResult<T> = Result<T, OidError>;
