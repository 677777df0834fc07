use keystone_data::DataError;
use keystone_types::Oid;

/// Errors from durable task operations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("unknown task kind: {0}")]
    UnknownKind(String),

    #[error("task kind already registered: {0}")]
    DuplicateKind(String),

    /// The period cannot be represented as a time delta.
    #[error("invalid task period: {0:?}")]
    InvalidPeriod(std::time::Duration),

    /// The task's transaction kept conflicting until attempts ran out.
    #[error("task {handle} gave up after {attempts} attempts: {source}")]
    Exhausted {
        handle: Oid,
        attempts: u32,
        source: DataError,
    },
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Data(e) if e.is_retryable())
    }
}

/// Result alias for task operations.
pub type TaskResult<T> = Result<T, TaskError>;
