//! cove Node Agent Library
//!
//! The node agent runs on each host and drives the containers assigned to
//! it. It converges each container toward the desired state recorded in
//! the coordination store and writes back what the container is doing.
//!
//! ## Architecture
//!
//! ```text
//! HostListener               (watches the host's instance list)
//! └── HostSupervisor         (registry of instance tasks)
//!     └── InstanceSupervisor(state_id)
//! ```
//!
//! ## Modules
//!
//! - `listener`: host registration and instance-list watch
//! - `supervisor`: per-host registry of instance tasks
//! - `instance`: the per-instance state machine
//! - `runtime`: container runtime seam with a mock implementation

pub mod config;
pub mod error;
pub mod instance;
pub mod listener;
pub mod runtime;
pub mod supervisor;

// Re-export commonly used types
pub use error::AgentError;
pub use instance::InstanceSupervisor;
pub use listener::HostListener;
pub use runtime::{ContainerInfo, ContainerRuntime, ExitWatch, MockRuntime};
pub use supervisor::HostSupervisor;
