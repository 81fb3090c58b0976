use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cove_id::PoolId;
use cove_reconcile::DEFAULT_RUN_LEVEL_TIMEOUT;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long one batch may take to converge before its waits are cancelled.
    pub run_level_timeout: Duration,

    /// Delay before a service sync that could not be fully applied is retried.
    pub sync_retry_interval: Duration,

    /// Pool whose subtree this control plane manages. `None` uses the root.
    pub pool_id: Option<PoolId>,

    pub log_level: String,

    /// JSON file with the service catalog to load at startup.
    pub services_file: Option<PathBuf>,

    /// Number of in-process node agents to run against the embedded store.
    pub dev_hosts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let run_level_timeout = std::env::var("COVE_RUN_LEVEL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RUN_LEVEL_TIMEOUT);

        let sync_retry_interval = std::env::var("COVE_SYNC_RETRY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        let pool_id = match std::env::var("COVE_POOL_ID") {
            Ok(raw) if !raw.is_empty() => {
                Some(PoolId::parse(&raw).with_context(|| format!("invalid COVE_POOL_ID {raw:?}"))?)
            }
            _ => None,
        };

        let log_level = std::env::var("COVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let services_file = std::env::var("COVE_SERVICES_FILE").ok().map(PathBuf::from);

        let dev_hosts = std::env::var("COVE_DEV_HOSTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Ok(Self {
            run_level_timeout,
            sync_retry_interval,
            pool_id,
            log_level,
            services_file,
            dev_hosts,
        })
    }
}
