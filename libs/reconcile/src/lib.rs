//! Batch reconciliation primitives.
//!
//! This library turns desired-state change requests into an ordered queue of
//! batches per tenant. Key concepts:
//!
//! - **Batch**: services sharing one desired state, one emergency flag and,
//!   once merged, one priority tier.
//! - **Pending batch**: the batch a tenant is currently executing.
//! - **Cancellation**: every queued service carries a one-shot signal that
//!   aborts the executor's wait for that one service.
//!
//! # Invariants
//!
//! - Emergency batches always sit ahead of non-emergency batches.
//! - After any merge every batch holds a single priority tier.
//! - A service appears at most once across the queued batches of a tenant.
//! - Decisions are deterministic given the same inputs.

use std::time::Duration;

use thiserror::Error;

mod batch;
mod cancel;
mod queue;

pub use batch::{merge_batches, priority_tier, PriorityTier, ServiceStateChangeBatch};
pub use cancel::{CancelSignal, CancellableService};
pub use queue::{PendingServiceStateChangeBatch, TenantQueue};

use cove_model::DesiredState;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Batches with different desired states or emergency flags were merged.
    #[error(
        "cannot merge batches with mismatched desired states: \
         {expected} (emergency={expected_emergency}) and {actual} (emergency={actual_emergency})"
    )]
    MismatchedDesiredStates {
        expected: DesiredState,
        expected_emergency: bool,
        actual: DesiredState,
        actual_emergency: bool,
    },

    /// No batch is waiting in the queue.
    #[error("batch queue is empty")]
    BatchQueueEmpty,
}

/// Default time a batch may take to converge before its waits are cancelled.
pub const DEFAULT_RUN_LEVEL_TIMEOUT: Duration = Duration::from_secs(10 * 60); // 10 minutes
