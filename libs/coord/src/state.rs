//! Instance state records.
//!
//! An instance is stored as two linked records:
//!
//! - the host-indexed record, whose existence means the host owns the
//!   instance;
//! - the service-indexed record, which carries desired state and runtime
//!   facts.
//!
//! An instance is valid only while both exist. Writers create and delete
//! both records without a transaction, so readers must tolerate either one
//! existing alone and clean such orphans up when they find them.

use std::fmt;

use chrono::{DateTime, Utc};
use cove_id::{HostId, PoolId, ServiceId};
use cove_model::{DesiredState, InstanceStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::client::{Connection, ConnectionExt, Watch};
use crate::error::CoordError;
use crate::{cancelled, host, path};

// =============================================================================
// Requests and records
// =============================================================================

/// Identifies one instance of a service placed on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateRequest {
    pub pool_id: Option<PoolId>,
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub instance_id: u32,
}

impl StateRequest {
    pub fn new(
        pool_id: Option<PoolId>,
        host_id: HostId,
        service_id: ServiceId,
        instance_id: u32,
    ) -> Self {
        Self {
            pool_id,
            host_id,
            service_id,
            instance_id,
        }
    }

    /// `{host}-{service}-{instance}`
    pub fn state_id(&self) -> String {
        format!("{}-{}-{}", self.host_id, self.service_id, self.instance_id)
    }

    /// Path of the host-indexed record.
    pub fn host_record_path(&self) -> String {
        path::join(
            &path::host_instances(self.pool_id.as_ref(), &self.host_id),
            &self.state_id(),
        )
    }

    /// Path of the service-indexed record.
    pub fn service_record_path(&self) -> String {
        path::join(
            &path::service(self.pool_id.as_ref(), &self.service_id),
            &self.state_id(),
        )
    }

    /// Build a request from a state ID found under `pool`.
    pub fn from_state_id(pool_id: Option<&PoolId>, state_id: &str) -> Result<Self, CoordError> {
        let (host_id, service_id, instance_id) = parse_state_id(state_id)?;
        Ok(Self::new(pool_id.cloned(), host_id, service_id, instance_id))
    }

    fn error(&self, operation: &'static str, message: impl Into<String>) -> StateError {
        StateError {
            request: self.clone(),
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.state_id())
    }
}

/// Split a state ID into host, service and instance.
pub fn parse_state_id(state_id: &str) -> Result<(HostId, ServiceId, u32), CoordError> {
    let invalid = || CoordError::InvalidStateId(state_id.to_string());
    let mut parts = state_id.splitn(3, '-');
    let (Some(host), Some(service), Some(instance)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let host_id = HostId::parse(host).map_err(|_| invalid())?;
    let service_id = ServiceId::parse(service).map_err(|_| invalid())?;
    let instance_id = instance.parse().map_err(|_| invalid())?;
    Ok((host_id, service_id, instance_id))
}

/// The host-indexed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub scheduled: DateTime<Utc>,
}

/// The service-indexed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub desired_state: DesiredState,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub status: InstanceStatus,
    pub scheduled: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restarted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminated: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    fn scheduled_at(now: DateTime<Utc>) -> Self {
        Self {
            desired_state: DesiredState::Run,
            container_id: None,
            image_id: None,
            paused: false,
            status: InstanceStatus::Stopped,
            scheduled: now,
            started: None,
            restarted: None,
            terminated: None,
        }
    }

    /// True when a restart has been requested since the current container
    /// started. A restart stamped with the start time itself was served by
    /// that start.
    pub fn restart_pending(&self) -> bool {
        match (self.started, self.restarted) {
            (Some(started), Some(restarted)) => restarted > started,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }

    /// Running with a container that started after the last restart request.
    pub fn is_running_fresh(&self) -> bool {
        self.status.is_running()
            && self.desired_state != DesiredState::Restart
            && !self.restart_pending()
    }
}

/// Both records of a valid instance, joined with the request.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub request: StateRequest,
    pub host: HostRecord,
    pub service: ServiceRecord,
}

/// Failure of a state operation against one instance.
#[derive(Debug, Clone, Error)]
#[error(
    "could not {operation} instance {} from service {} on host {}: {message}",
    request.instance_id,
    request.service_id,
    request.host_id
)]
pub struct StateError {
    pub request: StateRequest,
    pub operation: &'static str,
    pub message: String,
}

// =============================================================================
// Single-instance operations
// =============================================================================

/// Create both records of a new instance.
///
/// Fails if either record already exists.
#[instrument(skip(conn), fields(state_id = %req))]
pub async fn create_state<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let hpath = req.host_record_path();
    let spath = req.service_record_path();

    if conn.exists(&hpath).await? || conn.exists(&spath).await? {
        return Err(req.error("create", "state already exists").into());
    }

    let now = Utc::now();
    conn.create_json(&hpath, &HostRecord { scheduled: now })
        .await
        .map_err(|err| req.error("create", format!("could not create host state: {err}")))?;

    if let Err(err) = conn
        .create_json(&spath, &ServiceRecord::scheduled_at(now))
        .await
    {
        // Leave no orphan behind if we can help it.
        let _ = conn.delete(&hpath).await;
        return Err(req
            .error("create", format!("could not create service state: {err}"))
            .into());
    }

    debug!("Created instance state");
    Ok(())
}

/// Read both records of an instance.
///
/// Fails with a `get` state error when either record is missing, so a
/// half-written or half-deleted instance never reads as valid.
pub async fn get_state<C>(conn: &C, req: &StateRequest) -> Result<State, CoordError>
where
    C: Connection + ?Sized,
{
    let host: HostRecord = conn
        .get_json(&req.host_record_path())
        .await
        .map_err(|_| req.error("get", "could not look up host state"))?;
    let service: ServiceRecord = conn
        .get_json(&req.service_record_path())
        .await
        .map_err(|_| req.error("get", "could not look up service state"))?;
    Ok(State {
        request: req.clone(),
        host,
        service,
    })
}

/// Read-modify-write both records.
///
/// `mutate` returns whether the change should be persisted.
pub async fn update_state<C, F>(conn: &C, req: &StateRequest, mutate: F) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
    F: FnOnce(&mut State) -> bool + Send,
{
    let hpath = req.host_record_path();
    let spath = req.service_record_path();

    let host: HostRecord = conn
        .get_json(&hpath)
        .await
        .map_err(|_| req.error("update", "could not look up host state"))?;
    let service: ServiceRecord = conn
        .get_json(&spath)
        .await
        .map_err(|_| req.error("update", "could not look up service state"))?;

    let mut state = State {
        request: req.clone(),
        host,
        service,
    };
    if !mutate(&mut state) {
        return Ok(());
    }

    conn.set_json(&hpath, &state.host)
        .await
        .map_err(|_| req.error("update", "could not write host state"))?;
    conn.set_json(&spath, &state.service)
        .await
        .map_err(|_| req.error("update", "could not write service state"))?;
    Ok(())
}

/// Delete both records. Missing records are not an error.
///
/// A lost session is returned as [`CoordError::SessionExpired`] rather than
/// a state error so callers can tell it apart.
#[instrument(skip(conn), fields(state_id = %req))]
pub async fn delete_state<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    for (record, p) in [
        ("host", req.host_record_path()),
        ("service", req.service_record_path()),
    ] {
        match conn.delete(&p).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(CoordError::SessionExpired) => return Err(CoordError::SessionExpired),
            Err(err) => {
                return Err(req
                    .error("delete", format!("could not delete {record} state: {err}"))
                    .into())
            }
        }
    }
    debug!("Deleted instance state");
    Ok(())
}

/// True only when both records exist.
pub async fn is_valid_state<C>(conn: &C, req: &StateRequest) -> Result<bool, CoordError>
where
    C: Connection + ?Sized,
{
    let host = conn
        .exists(&req.host_record_path())
        .await
        .map_err(|_| req.error("exists", "could not look up host state"))?;
    if !host {
        return Ok(false);
    }
    conn.exists(&req.service_record_path())
        .await
        .map_err(|_| req.error("exists", "could not look up service state").into())
}

async fn watch_record<C>(conn: &C, p: &str) -> Result<(Option<Vec<u8>>, Watch), CoordError>
where
    C: Connection + ?Sized,
{
    loop {
        match conn.get_w(p).await {
            Ok((data, watch)) => return Ok((Some(data), watch)),
            Err(CoordError::NoNode(_)) => {}
            Err(err) => return Err(err),
        }
        match conn.exists_w(p).await? {
            (false, watch) => return Ok((None, watch)),
            // Created between the two calls; read it again.
            (true, _) => continue,
        }
    }
}

/// Block until `check` accepts the instance's state.
///
/// `check` receives `None` while the instance does not exist. Returns the
/// accepted state, or `None` if it was accepted while absent or `cancel` was
/// raised. Fails if the two records disagree about existence, or if the
/// instance is gone and `check` does not accept that.
pub async fn monitor_state<C, F>(
    cancel: &mut watch::Receiver<bool>,
    conn: &C,
    req: &StateRequest,
    mut check: F,
) -> Result<Option<State>, CoordError>
where
    C: Connection + ?Sized,
    F: FnMut(Option<&State>) -> bool + Send,
{
    loop {
        let (host_data, host_watch) = watch_record(conn, &req.host_record_path())
            .await
            .map_err(|_| req.error("watch", "could not watch host state"))?;
        let (service_data, service_watch) = watch_record(conn, &req.service_record_path())
            .await
            .map_err(|_| req.error("watch", "could not watch service state"))?;

        let state = match (host_data, service_data) {
            (Some(h), Some(s)) => Some(State {
                request: req.clone(),
                host: serde_json::from_slice(&h)?,
                service: serde_json::from_slice(&s)?,
            }),
            (None, None) => None,
            _ => return Err(req.error("watch", "incongruent state").into()),
        };

        if check(state.as_ref()) {
            return Ok(state);
        }
        if state.is_none() {
            return Err(req.error("watch", "state does not exist").into());
        }

        tokio::select! {
            _ = host_watch => {}
            _ = service_watch => {}
            _ = cancelled(cancel) => {
                debug!(state_id = %req, "Aborted state monitor");
                return Ok(None);
            }
        }
    }
}

// =============================================================================
// Instance intents
// =============================================================================

/// Ask an instance to stop.
///
/// If its host is offline nobody would act on the request, so the records
/// are deleted outright.
pub async fn stop_instance<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    if !host::is_host_active(conn, req.pool_id.as_ref(), &req.host_id).await? {
        debug!(state_id = %req, "Host is offline, removing instance state");
        return delete_state(conn, req).await;
    }
    update_state(conn, req, |state| {
        state.service.desired_state = DesiredState::Stop;
        true
    })
    .await
}

async fn transition<C>(
    conn: &C,
    req: &StateRequest,
    from: DesiredState,
    to: DesiredState,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    update_state(conn, req, |state| {
        if state.service.desired_state == from {
            state.service.desired_state = to;
            true
        } else {
            false
        }
    })
    .await
}

/// Run → Pause.
pub async fn pause_instance<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    transition(conn, req, DesiredState::Run, DesiredState::Pause).await
}

/// Pause → Run.
pub async fn resume_instance<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    transition(conn, req, DesiredState::Pause, DesiredState::Run).await
}

/// Run → Restart.
pub async fn restart_instance<C>(conn: &C, req: &StateRequest) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    transition(conn, req, DesiredState::Run, DesiredState::Restart).await
}

// =============================================================================
// Listings
// =============================================================================

async fn children_or_empty<C>(conn: &C, p: &str) -> Result<Vec<String>, CoordError>
where
    C: Connection + ?Sized,
{
    match conn.children(p).await {
        Ok(children) => Ok(children),
        Err(CoordError::NoNode(_)) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// Requests for every instance record under a service.
pub async fn get_service_state_ids<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> Result<Vec<StateRequest>, CoordError>
where
    C: Connection + ?Sized,
{
    children_or_empty(conn, &path::service(pool_id, service_id))
        .await?
        .iter()
        .map(|id| StateRequest::from_state_id(pool_id, id))
        .collect()
}

/// Requests for every instance record under a host.
pub async fn get_host_state_ids<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    host_id: &HostId,
) -> Result<Vec<StateRequest>, CoordError>
where
    C: Connection + ?Sized,
{
    children_or_empty(conn, &path::host_instances(pool_id, host_id))
        .await?
        .iter()
        .map(|id| StateRequest::from_state_id(pool_id, id))
        .collect()
}

/// Full state of every instance of a service.
pub async fn get_service_states<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> Result<Vec<State>, CoordError>
where
    C: Connection + ?Sized,
{
    let mut states = Vec::new();
    for req in get_service_state_ids(conn, pool_id, service_id).await? {
        states.push(get_state(conn, &req).await?);
    }
    Ok(states)
}

/// Full state of every instance on a host.
pub async fn get_host_states<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    host_id: &HostId,
) -> Result<Vec<State>, CoordError>
where
    C: Connection + ?Sized,
{
    let mut states = Vec::new();
    for req in get_host_state_ids(conn, pool_id, host_id).await? {
        states.push(get_state(conn, &req).await?);
    }
    Ok(states)
}

/// The host an instance of a service is placed on, if any.
pub async fn get_service_state_host_id<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
    instance_id: u32,
) -> Result<Option<HostId>, CoordError>
where
    C: Connection + ?Sized,
{
    let suffix = format!("-{service_id}-{instance_id}");
    for state_id in children_or_empty(conn, &path::service(pool_id, service_id)).await? {
        if state_id.ends_with(&suffix) {
            let (host_id, _, _) = parse_state_id(&state_id)?;
            return Ok(Some(host_id));
        }
    }
    Ok(None)
}

// =============================================================================
// Bulk deletion and cleanup
// =============================================================================

/// Delete every instance of a service. Returns how many were deleted.
pub async fn delete_service_states<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> usize
where
    C: Connection + ?Sized,
{
    let ids = match children_or_empty(conn, &path::service(pool_id, service_id)).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(service_id = %service_id, error = %err, "Could not list service states");
            return 0;
        }
    };
    delete_each(conn, pool_id, &ids).await
}

/// Delete every instance on a host. Returns how many were deleted.
pub async fn delete_host_states<C>(conn: &C, pool_id: Option<&PoolId>, host_id: &HostId) -> usize
where
    C: Connection + ?Sized,
{
    delete_host_states_when(conn, pool_id, host_id, |_| true).await
}

/// Delete the instances on a host whose state satisfies `when`.
pub async fn delete_host_states_when<C, F>(
    conn: &C,
    pool_id: Option<&PoolId>,
    host_id: &HostId,
    when: F,
) -> usize
where
    C: Connection + ?Sized,
    F: Fn(&State) -> bool + Send + Sync,
{
    let ids = match children_or_empty(conn, &path::host_instances(pool_id, host_id)).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(host_id = %host_id, error = %err, "Could not list host states");
            return 0;
        }
    };

    let mut count = 0;
    for id in ids {
        let Ok(req) = StateRequest::from_state_id(pool_id, &id) else {
            continue;
        };
        let Ok(state) = get_state(conn, &req).await else {
            continue;
        };
        if when(&state) && delete_state(conn, &req).await.is_ok() {
            count += 1;
        }
    }
    count
}

async fn delete_each<C>(conn: &C, pool_id: Option<&PoolId>, ids: &[String]) -> usize
where
    C: Connection + ?Sized,
{
    let mut count = 0;
    for id in ids {
        let Ok(req) = StateRequest::from_state_id(pool_id, id) else {
            continue;
        };
        match delete_state(conn, &req).await {
            Ok(()) => count += 1,
            Err(err) => debug!(state_id = %id, error = %err, "Could not delete state"),
        }
    }
    count
}

/// Remove records under `parent` that cannot be parsed or whose
/// counterpart is missing.
async fn clean_states<C>(conn: &C, pool_id: Option<&PoolId>, parent: &str) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    for state_id in children_or_empty(conn, parent).await? {
        let req = match StateRequest::from_state_id(pool_id, &state_id) {
            Ok(req) => req,
            Err(_) => {
                match conn.delete(&path::join(parent, &state_id)).await {
                    Ok(()) | Err(CoordError::NoNode(_)) => {}
                    Err(err) => return Err(err),
                }
                warn!(state_id = %state_id, "Deleted invalid state");
                continue;
            }
        };

        if !is_valid_state(conn, &req).await? {
            delete_state(conn, &req).await?;
            warn!(state_id = %state_id, "Deleted incongruent state");
        }
    }
    Ok(())
}

/// Delete orphaned or malformed records under a host.
#[instrument(skip(conn, pool_id))]
pub async fn clean_host_states<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    host_id: &HostId,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    clean_states(conn, pool_id, &path::host_instances(pool_id, host_id)).await
}

/// Delete orphaned or malformed records under a service.
#[instrument(skip(conn, pool_id))]
pub async fn clean_service_states<C>(
    conn: &C,
    pool_id: Option<&PoolId>,
    service_id: &ServiceId,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    clean_states(conn, pool_id, &path::service(pool_id, service_id)).await
}
