//! Shared domain model.
//!
//! - [`DesiredState`]: the lifecycle target for a service or instance.
//! - [`Service`]: the scheduling view of a service, owned by the
//!   orchestration facade and read-only to the scheduler.
//! - [`InstanceStatus`]: the runtime status an instance reports.
//! - [`ServiceCurrentState`]: where a service stands in the scheduler's
//!   request lifecycle.

mod service;
mod state;

pub use service::{ChangeOption, Service};
pub use state::{DesiredState, InstanceStatus, ParseStateError, ServiceCurrentState};
