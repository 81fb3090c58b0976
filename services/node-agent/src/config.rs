//! Configuration for the node agent.

use anyhow::{Context, Result};
use cove_id::{HostId, PoolId};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this host.
    pub host_id: HostId,

    /// Pool the host belongs to; `None` for the root namespace.
    pub pool_id: Option<PoolId>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Host ID can be provided or auto-generated
        let host_id = match std::env::var("COVE_HOST_ID") {
            Ok(s) => HostId::parse(&s).context("invalid COVE_HOST_ID")?,
            Err(_) => HostId::new(),
        };

        let pool_id = std::env::var("COVE_POOL_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| PoolId::parse(&s))
            .transpose()
            .context("invalid COVE_POOL_ID")?;

        let log_level = std::env::var("COVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host_id,
            pool_id,
            log_level,
        })
    }
}
