//! Online-host registry.
//!
//! A host is active while its ephemeral node under `{base}/online` exists,
//! which lasts as long as the agent's session.

use cove_id::{HostId, PoolId};
use tracing::{info, warn};

use crate::client::Connection;
use crate::error::CoordError;
use crate::path;

/// Mark a host as online for the lifetime of `conn`'s session.
///
/// A node left behind by an earlier session of the same host is replaced.
pub async fn register_host<C>(conn: &C, pool_id: Option<&PoolId>, host_id: &HostId) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let p = path::online_host(pool_id, host_id);
    match conn.create_ephemeral(&p, Vec::new()).await {
        Ok(()) => {}
        Err(CoordError::NodeExists(_)) => {
            warn!(host_id = %host_id, "Replacing stale host registration");
            match conn.delete(&p).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(err) => return Err(err),
            }
            conn.create_ephemeral(&p, Vec::new()).await?;
        }
        Err(err) => return Err(err),
    }
    info!(host_id = %host_id, "Host registered");
    Ok(())
}

/// Hosts that are currently online.
pub async fn get_active_hosts<C>(conn: &C, pool_id: Option<&PoolId>) -> Result<Vec<HostId>, CoordError>
where
    C: Connection + ?Sized,
{
    let children = match conn.children(&path::online_hosts(pool_id)).await {
        Ok(children) => children,
        Err(CoordError::NoNode(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(children
        .iter()
        .filter_map(|id| match HostId::parse(id) {
            Ok(host_id) => Some(host_id),
            Err(err) => {
                warn!(node = %id, error = %err, "Ignoring malformed host registration");
                None
            }
        })
        .collect())
}

pub async fn is_host_active<C>(conn: &C, pool_id: Option<&PoolId>, host_id: &HostId) -> Result<bool, CoordError>
where
    C: Connection + ?Sized,
{
    conn.exists(&path::online_host(pool_id, host_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_registration_follows_session() {
        let store = MemoryStore::new();
        let agent = store.connect().await;
        let observer = store.connect().await;
        let pool = PoolId::parse("default").unwrap();
        let host = HostId::parse("h1").unwrap();

        assert!(get_active_hosts(&observer, Some(&pool)).await.unwrap().is_empty());

        register_host(&agent, Some(&pool), &host).await.unwrap();
        register_host(&agent, Some(&pool), &host).await.unwrap();
        assert!(is_host_active(&observer, Some(&pool), &host).await.unwrap());
        assert_eq!(get_active_hosts(&observer, Some(&pool)).await.unwrap(), vec![host.clone()]);

        agent.close().await;
        assert!(!is_host_active(&observer, Some(&pool), &host).await.unwrap());
    }
}
