use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] keystone_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] keystone_storage::StoreError),

    #[error("oid reservation failed: {0}")]
    Oids(#[from] keystone_oids::OidError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
