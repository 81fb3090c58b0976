//! cove control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but exposes its
//! scheduling core for integration testing and reuse:
//!
//! - [`scheduler`]: per-tenant batch queues and their executor loops.
//! - [`facade`]: the orchestration seam the executor drives.
//! - [`sync`]: per-service loops that keep instance records in line with
//!   each service's desired state and instance count.

pub mod config;
pub mod facade;
pub mod scheduler;
pub mod sync;
