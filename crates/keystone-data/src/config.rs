use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for one application's data layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Wall-clock budget per transaction attempt; `None` means untimed.
    pub transaction_timeout_ms: Option<u64>,
    /// Attempts before a retryable failure is reported to the caller.
    pub max_attempts: u32,
    /// Upper bound of the random pause between attempts, scaled by attempt number.
    pub retry_backoff_ms: u64,
    /// Oids per reservation when the context owns a storage-backed allocator.
    pub oid_block_size: u64,
}

impl DataConfig {
    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: None,
            max_attempts: 10,
            retry_backoff_ms: 10,
            oid_block_size: keystone_oids::DEFAULT_BLOCK_SIZE,
        }
    }
}
