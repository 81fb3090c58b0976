//! Scheduling view of a service.

use cove_id::{ServiceId, TenantId};
use serde::{Deserialize, Serialize};

use crate::{DesiredState, ServiceCurrentState};

/// Options that change how instance-count changes are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOption {
    /// Stop every instance when the instance count changes, then start the
    /// new count from scratch.
    #[serde(rename = "restartAllOnInstanceChanged")]
    RestartAllOnInstanceChanged,
}

/// A service as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub tenant_id: TenantId,
    pub name: String,

    /// Ascending start priority. Level 0 means unset and starts last.
    pub start_level: u32,

    /// Priority during emergency stop, evaluated before the start level.
    pub emergency_shutdown_level: u32,

    /// Set once the service has been put through an emergency stop.
    #[serde(default)]
    pub emergency_shutdown: bool,

    pub desired_state: DesiredState,

    /// Last state recorded by the batch scheduler.
    #[serde(default)]
    pub current_state: ServiceCurrentState,

    /// Target replica count.
    pub instances: u32,

    #[serde(default)]
    pub change_options: Vec<ChangeOption>,
}

impl Service {
    /// A running single-instance service with default priorities.
    pub fn new(id: ServiceId, tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            name: name.into(),
            start_level: 0,
            emergency_shutdown_level: 0,
            emergency_shutdown: false,
            desired_state: DesiredState::Run,
            current_state: ServiceCurrentState::Unknown,
            instances: 1,
            change_options: Vec::new(),
        }
    }

    pub fn with_levels(mut self, start_level: u32, emergency_shutdown_level: u32) -> Self {
        self.start_level = start_level;
        self.emergency_shutdown_level = emergency_shutdown_level;
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_change_option(mut self, option: ChangeOption) -> Self {
        if !self.change_options.contains(&option) {
            self.change_options.push(option);
        }
        self
    }

    pub fn has_change_option(&self, option: ChangeOption) -> bool {
        self.change_options.contains(&option)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> Service {
        Service::new(
            ServiceId::parse("web").unwrap(),
            TenantId::parse("acme").unwrap(),
            "web",
        )
    }

    #[test]
    fn test_change_option_serde() {
        let svc = test_service().with_change_option(ChangeOption::RestartAllOnInstanceChanged);
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["change_options"][0], "restartAllOnInstanceChanged");
        assert!(svc.has_change_option(ChangeOption::RestartAllOnInstanceChanged));
    }

    #[test]
    fn test_change_option_not_duplicated() {
        let svc = test_service()
            .with_change_option(ChangeOption::RestartAllOnInstanceChanged)
            .with_change_option(ChangeOption::RestartAllOnInstanceChanged);
        assert_eq!(svc.change_options.len(), 1);
    }

    #[test]
    fn test_service_json_roundtrip() {
        let svc = test_service().with_levels(2, 1).with_instances(3);
        let json = serde_json::to_string(&svc).unwrap();
        let parsed: Service = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, svc);
    }
}
