use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A field ran past the end of the payload.
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("unterminated string")]
    UnterminatedString,

    #[error("string contains NUL")]
    EmbeddedNul,

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid presence flag: {0}")]
    InvalidFlag(u8),

    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
