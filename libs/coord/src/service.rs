//! Service nodes and convergence waits.

use cove_id::{PoolId, ServiceId};
use cove_model::{DesiredState, Service};
use futures_util::future::select_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::client::{Connection, ConnectionExt, Watch};
use crate::error::CoordError;
use crate::state::ServiceRecord;
use crate::{cancelled, path};

/// The node a service's sync loop watches.
///
/// A locked service keeps its existing instances but does not start new
/// ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub service: Service,
    #[serde(default)]
    pub locked: bool,
}

/// Create the service node, or overwrite it if it exists.
pub async fn update_service<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service: &Service,
    locked: bool,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let p = path::service(pool_id, &service.id);
    let node = ServiceNode {
        service: service.clone(),
        locked,
    };
    match conn.create_json(&p, &node).await {
        Ok(()) => Ok(()),
        Err(CoordError::NodeExists(_)) => conn.set_json(&p, &node).await,
        Err(err) => Err(err),
    }
}

pub async fn get_service_node<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> Result<ServiceNode, CoordError>
where
    C: Connection + ?Sized,
{
    conn.get_json(&path::service(pool_id, service_id)).await
}

/// Delete a service node.
///
/// Refuses with [`CoordError::NotEmpty`] while instance records remain.
/// Deleting a missing service is a no-op.
pub async fn remove_service<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let p = path::service(pool_id, service_id);
    match conn.children(&p).await {
        Ok(children) if !children.is_empty() => Err(CoordError::NotEmpty(p)),
        Ok(_) => match conn.delete(&p).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(err) => Err(err),
        },
        Err(CoordError::NoNode(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Block until a service's instances reach `desired_state`.
///
/// - Stop: no instance records remain.
/// - Run and Restart: at least `instances` records are running a container
///   started after the last restart request.
/// - Pause: no record is running unpaused.
///
/// Returns `false` if `cancel` was raised first.
#[instrument(skip(cancel, conn, pool_id))]
pub async fn wait_service<C>(
    cancel: &mut watch::Receiver<bool>,
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
    desired_state: DesiredState,
) -> Result<bool, CoordError>
where
    C: Connection + ?Sized,
{
    let spath = path::service(pool_id, service_id);
    loop {
        let (children, children_watch) = match conn.children_w(&spath).await {
            Ok(listing) => listing,
            Err(CoordError::NoNode(_)) => {
                if desired_state == DesiredState::Stop {
                    return Ok(true);
                }
                let (exists, watch) = conn.exists_w(&spath).await?;
                if !exists && !wait_or_cancel(cancel, vec![watch]).await {
                    return Ok(false);
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        let mut watches = vec![children_watch];
        let mut records = Vec::with_capacity(children.len());
        for id in &children {
            match conn.get_json_w::<ServiceRecord>(&path::join(&spath, id)).await {
                Ok((record, watch)) => {
                    records.push(record);
                    watches.push(watch);
                }
                Err(CoordError::NoNode(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let converged = match desired_state {
            DesiredState::Stop => children.is_empty(),
            DesiredState::Run | DesiredState::Restart => {
                let (node, watch) = conn.get_json_w::<ServiceNode>(&spath).await?;
                watches.push(watch);
                let running = records.iter().filter(|r| r.is_running_fresh()).count();
                debug!(running, target = node.service.instances, "Checked running instances");
                running >= node.service.instances as usize
            }
            DesiredState::Pause => records
                .iter()
                .all(|r| r.paused || !r.status.is_running()),
        };
        if converged {
            return Ok(true);
        }

        if !wait_or_cancel(cancel, watches).await {
            return Ok(false);
        }
    }
}

/// Wait for any watch to fire. Returns `false` if cancelled first.
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, watches: Vec<Watch>) -> bool {
    tokio::select! {
        _ = select_all(watches) => true,
        _ = cancelled(cancel) => false,
    }
}
