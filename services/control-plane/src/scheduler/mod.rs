//! Batch scheduling of desired-state changes.
//!
//! Each tenant owns a [`TenantQueue`](cove_reconcile::TenantQueue) and one
//! executor loop:
//!
//! - `schedule_services` reconciles a request into the queue and wakes the
//!   loop.
//! - The loop dequeues the head batch, hands it to the [`Facade`], then
//!   waits for every member to converge, bounded by the run-level timeout.
//! - Cancelling a member aborts only the wait for that member.
//! - Each service's current state follows it from pending to transition to
//!   settled, and requests a settled service already satisfies are dropped.
//!
//! Tenants share nothing but the facade, so their loops run fully in
//! parallel.
//!
//! [`Facade`]: crate::facade::Facade

mod current;
mod executor;
mod manager;

pub use manager::BatchServiceStateManager;

use cove_reconcile::ReconcileError;
use thiserror::Error;

/// Errors returned by the batch scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("tenant is not managed")]
    BadTenant,

    #[error("tenant is already managed")]
    DuplicateTenant,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is already running")]
    AlreadyStarted,

    #[error("timed out waiting for batch to converge")]
    WaitTimeout,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Facade(#[from] anyhow::Error),
}
