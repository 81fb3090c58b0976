//! Orchestration facade.
//!
//! The batch executor never touches instances directly. It asks the facade
//! to schedule a batch and then to wait for each service to converge.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cove_coord::service::{get_service_node, update_service, wait_service};
use cove_coord::state::{get_service_state_ids, restart_instance};
use cove_coord::{Connection, CoordError};
use cove_id::{PoolId, ServiceId, TenantId};
use cove_model::{DesiredState, Service, ServiceCurrentState};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Capabilities the batch executor consumes.
#[async_trait]
pub trait Facade: Send + Sync + 'static {
    /// Tenants to manage at startup.
    async fn get_tenant_ids(&self) -> Result<Vec<TenantId>>;

    /// Current definitions of the given services. Unknown IDs are omitted.
    async fn get_services_for_scheduling(&self, ids: &[ServiceId]) -> Result<Vec<Service>>;

    /// Hand a batch to the orchestrator. Returns how many services were
    /// scheduled.
    async fn schedule_service_batch(
        &self,
        services: &[Service],
        tenant_id: &TenantId,
        desired_state: DesiredState,
    ) -> Result<usize>;

    /// Block until one service reaches `desired_state` or `cancel` is raised.
    async fn wait_single_service(
        &self,
        service: &Service,
        desired_state: DesiredState,
        cancel: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Persist durable service metadata.
    async fn update_service(&self, service: &Service) -> Result<()>;

    /// Record the scheduler's view of where each service stands.
    async fn set_services_current_state(
        &self,
        current_state: ServiceCurrentState,
        ids: &[ServiceId],
    ) -> Result<()>;
}

/// A [`Facade`] over the coordination store and an in-process catalog.
pub struct StoreFacade<C: Connection + ?Sized> {
    conn: Arc<C>,
    pool_id: Option<PoolId>,
    catalog: RwLock<HashMap<ServiceId, Service>>,
}

impl<C: Connection + ?Sized> StoreFacade<C> {
    pub fn new(conn: Arc<C>, pool_id: Option<PoolId>) -> Self {
        Self {
            conn,
            pool_id,
            catalog: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a service definition.
    pub async fn put_service(&self, service: Service) {
        self.catalog.write().await.insert(service.id.clone(), service);
    }

    pub async fn remove_service(&self, id: &ServiceId) -> Option<Service> {
        self.catalog.write().await.remove(id)
    }

    pub async fn service(&self, id: &ServiceId) -> Option<Service> {
        self.catalog.read().await.get(id).cloned()
    }

    /// Every service owned by a tenant.
    pub async fn tenant_services(&self, tenant_id: &TenantId) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .catalog
            .read()
            .await
            .values()
            .filter(|s| &s.tenant_id == tenant_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Lock state of an existing service node, `false` if there is none.
    async fn locked(&self, id: &ServiceId) -> Result<bool> {
        match get_service_node(self.conn.as_ref(), self.pool_id.as_ref(), id).await {
            Ok(node) => Ok(node.locked),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl<C: Connection + ?Sized + 'static> Facade for StoreFacade<C> {
    async fn get_tenant_ids(&self) -> Result<Vec<TenantId>> {
        let tenants: BTreeSet<TenantId> = self
            .catalog
            .read()
            .await
            .values()
            .map(|s| s.tenant_id.clone())
            .collect();
        Ok(tenants.into_iter().collect())
    }

    async fn get_services_for_scheduling(&self, ids: &[ServiceId]) -> Result<Vec<Service>> {
        let catalog = self.catalog.read().await;
        Ok(ids.iter().filter_map(|id| catalog.get(id).cloned()).collect())
    }

    async fn schedule_service_batch(
        &self,
        services: &[Service],
        tenant_id: &TenantId,
        desired_state: DesiredState,
    ) -> Result<usize> {
        let pool = self.pool_id.as_ref();
        let conn = self.conn.as_ref();

        for service in services {
            // Restart is carried out per instance; the service itself keeps running.
            let mut node_service = service.clone();
            node_service.desired_state = desired_state.convergence_target();

            let locked = self.locked(&service.id).await?;
            update_service(conn, pool, &node_service, locked).await?;
            self.put_service(node_service).await;

            if desired_state == DesiredState::Restart {
                for req in get_service_state_ids(conn, pool, &service.id).await? {
                    if let Err(err) = restart_instance(conn, &req).await {
                        warn!(state_id = %req, error = %err, "Could not flag instance for restart");
                    }
                }
            }
            debug!(service_id = %service.id, desired_state = %desired_state, "Scheduled service");
        }

        info!(
            tenant_id = %tenant_id,
            desired_state = %desired_state,
            count = services.len(),
            "Scheduled service batch"
        );
        Ok(services.len())
    }

    async fn wait_single_service(
        &self,
        service: &Service,
        desired_state: DesiredState,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let converged = wait_service(
            &mut cancel,
            self.conn.as_ref(),
            self.pool_id.as_ref(),
            &service.id,
            desired_state,
        )
        .await?;
        if !converged {
            debug!(service_id = %service.id, "Wait cancelled");
        }
        Ok(())
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        let pool = self.pool_id.as_ref();
        match get_service_node(self.conn.as_ref(), pool, &service.id).await {
            Ok(node) => {
                update_service(self.conn.as_ref(), pool, service, node.locked).await?;
            }
            Err(CoordError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.put_service(service.clone()).await;
        Ok(())
    }

    async fn set_services_current_state(
        &self,
        current_state: ServiceCurrentState,
        ids: &[ServiceId],
    ) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        for id in ids {
            match catalog.get_mut(id) {
                Some(service) => service.current_state = current_state,
                None => debug!(service_id = %id, "Not recording current state of unknown service"),
            }
        }
        Ok(())
    }
}
