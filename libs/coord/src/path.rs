//! Path construction for the coordination store layout.

use cove_id::{HostId, PoolId, ServiceId};

/// Root of a pool's subtree.
pub fn base(pool: Option<&PoolId>) -> String {
    match pool {
        Some(pool) => format!("/pools/{pool}"),
        None => "/".to_string(),
    }
}

/// Append segments to a path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Checks that a path is absolute with no empty segments.
pub fn is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

pub fn online_hosts(pool: Option<&PoolId>) -> String {
    join(&base(pool), "online")
}

pub fn online_host(pool: Option<&PoolId>, host: &HostId) -> String {
    join(&online_hosts(pool), host.as_str())
}

pub fn host_instances(pool: Option<&PoolId>, host: &HostId) -> String {
    join(&join(&join(&base(pool), "hosts"), host.as_str()), "instances")
}

pub fn services(pool: Option<&PoolId>) -> String {
    join(&base(pool), "services")
}

pub fn service(pool: Option<&PoolId>, service: &ServiceId) -> String {
    join(&services(pool), service.as_str())
}
