//! Coordination store access for the orchestration core.
//!
//! The coordination store is a hierarchical, watchable key-value service
//! with ephemeral nodes. This crate provides:
//!
//! - [`Connection`]: the store client seam, with an in-process
//!   [`MemoryStore`] implementation.
//! - [`state`]: the two-record instance state entity (host-indexed and
//!   service-indexed records) and its self-healing cleanup.
//! - [`host`]: the online-host registry.
//! - [`service`]: service nodes and convergence waits.
//!
//! # Layout
//!
//! ```text
//! {base}/online/{host}                         ephemeral, host is up
//! {base}/hosts/{host}/instances/{state_id}     host-indexed record
//! {base}/services/{service}                    service node
//! {base}/services/{service}/{state_id}         service-indexed record
//! ```
//!
//! `base` is `/` or `/pools/{pool}`.

pub mod client;
pub mod error;
pub mod host;
pub mod memory;
pub mod path;
pub mod service;
pub mod state;

pub use client::{delete_recursive, Connection, ConnectionExt, Watch, WatchEvent};
pub use error::CoordError;
pub use memory::{MemoryConnection, MemoryStore};
pub use state::{HostRecord, ServiceRecord, State, StateError, StateRequest};

use tokio::sync::watch;

/// Resolves once `cancel` is raised or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|raised| *raised).await;
}
