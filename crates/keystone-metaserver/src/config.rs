use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaServerConfig {
    /// Node protocol listener.
    pub bind_addr: SocketAddr,
    /// Admin HTTP listener; disabled when unset.
    pub admin_addr: Option<SocketAddr>,
    /// Oids handed out per `REQUEST_OIDS`.
    pub oid_block_size: u64,
    /// Retry hint sent with every lock denial.
    pub lock_retry_after_ms: u64,
    pub max_connections: usize,
}

impl Default for MetaServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 44530)),
            admin_addr: Some(SocketAddr::from(([127, 0, 0, 1], 44531))),
            oid_block_size: keystone_oids::DEFAULT_BLOCK_SIZE,
            lock_retry_after_ms: 20,
            max_connections: 256,
        }
    }
}

impl MetaServerConfig {
    pub fn from_toml_str(s: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.oid_block_size == 0 {
            return Err(ServerError::Config("oid_block_size must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }
}
