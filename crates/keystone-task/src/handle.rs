use std::time::Duration;

use chrono::{DateTime, Utc};
use keystone_types::{Identity, Oid};
use serde::{Deserialize, Serialize};

/// Prefix of the bindings that index pending durable tasks.
pub const PENDING_TASK_PREFIX: &str = "pending-task.";

/// Serialization name under which handles are stored.
pub const HANDLE_SERIALIZATION: &str = "durable-task-handle";

/// The recovery binding for the handle stored at `handle`.
pub fn binding_name(handle: Oid) -> String {
    format!("{PENDING_TASK_PREFIX}{}", handle.to_hex())
}

/// Persisted description of one pending task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableTaskHandle {
    /// Oid of the task's data object.
    pub data: Oid,
    /// Serialization the data object is stored with.
    pub data_serialization: String,
    /// Registered task kind; selects the worker.
    pub kind: String,
    /// Recovery binding, once the handle has been bound.
    pub binding: Option<String>,
    /// Principal the task runs as.
    pub identity: Identity,
    /// Cleared by cancellation; a non-repeating task is removed after it runs.
    pub repeats: bool,
    pub period: Option<Duration>,
    pub target_execution_time: DateTime<Utc>,
}

impl DurableTaskHandle {
    pub fn is_periodic(&self) -> bool {
        self.repeats && self.period.is_some()
    }
}
