//! Desired and observed lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a state string or code is not recognized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown state: {0}")]
pub struct ParseStateError(pub String);

/// Target lifecycle state for a service or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Cycle the running containers once, then keep running.
    Restart,
    Stop,
    #[serde(rename = "go")]
    Run,
    Pause,
}

impl DesiredState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Restart => "restart",
            DesiredState::Stop => "stop",
            DesiredState::Run => "go",
            DesiredState::Pause => "pause",
        }
    }

    /// Integer code used by persisted records.
    pub fn as_i32(&self) -> i32 {
        match self {
            DesiredState::Restart => -1,
            DesiredState::Stop => 0,
            DesiredState::Run => 1,
            DesiredState::Pause => 2,
        }
    }

    pub fn from_i32(code: i32) -> Result<Self, ParseStateError> {
        match code {
            -1 => Ok(DesiredState::Restart),
            0 => Ok(DesiredState::Stop),
            1 => Ok(DesiredState::Run),
            2 => Ok(DesiredState::Pause),
            other => Err(ParseStateError(other.to_string())),
        }
    }

    /// The state a batch with this desired state is waited on as.
    ///
    /// A restarted instance eventually reports running, so restart batches
    /// converge on `Run`.
    pub fn convergence_target(&self) -> DesiredState {
        match self {
            DesiredState::Restart => DesiredState::Run,
            other => *other,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(DesiredState::Restart),
            "stop" => Ok(DesiredState::Stop),
            "go" | "run" => Ok(DesiredState::Run),
            "pause" => Ok(DesiredState::Pause),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Runtime status of a single instance, written by the node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Restarting,
    Stopping,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Pausing => "pausing",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Resuming => "resuming",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Stopping => "stopping",
        }
    }

    /// True when a container is up and not paused.
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, InstanceStatus::Paused)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service-level lifecycle state as tracked by the batch scheduler.
///
/// Each desired state has a pending form (queued), a transition form
/// (being applied) and a final form (converged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCurrentState {
    #[default]
    Unknown,
    Stopped,
    PendingStart,
    Starting,
    Running,
    PendingRestart,
    Restarting,
    PendingStop,
    Stopping,
    PendingPause,
    Pausing,
    Paused,
    PendingEmergencyStop,
    EmergencyStopping,
    EmergencyStopped,
}

impl ServiceCurrentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCurrentState::Unknown => "unknown",
            ServiceCurrentState::Stopped => "stopped",
            ServiceCurrentState::PendingStart => "pending_start",
            ServiceCurrentState::Starting => "starting",
            ServiceCurrentState::Running => "running",
            ServiceCurrentState::PendingRestart => "pending_restart",
            ServiceCurrentState::Restarting => "restarting",
            ServiceCurrentState::PendingStop => "pending_stop",
            ServiceCurrentState::Stopping => "stopping",
            ServiceCurrentState::PendingPause => "pending_pause",
            ServiceCurrentState::Pausing => "pausing",
            ServiceCurrentState::Paused => "paused",
            ServiceCurrentState::PendingEmergencyStop => "pending_emergency_stop",
            ServiceCurrentState::EmergencyStopping => "emergency_stopping",
            ServiceCurrentState::EmergencyStopped => "emergency_stopped",
        }
    }

    /// State of a service whose request is queued.
    pub fn pending(desired_state: DesiredState, emergency: bool) -> Self {
        match desired_state {
            DesiredState::Stop if emergency => ServiceCurrentState::PendingEmergencyStop,
            DesiredState::Stop => ServiceCurrentState::PendingStop,
            DesiredState::Run => ServiceCurrentState::PendingStart,
            DesiredState::Restart => ServiceCurrentState::PendingRestart,
            DesiredState::Pause => ServiceCurrentState::PendingPause,
        }
    }

    /// State of a service whose request is being applied.
    pub fn transition(desired_state: DesiredState, emergency: bool) -> Self {
        match desired_state {
            DesiredState::Stop if emergency => ServiceCurrentState::EmergencyStopping,
            DesiredState::Stop => ServiceCurrentState::Stopping,
            DesiredState::Run => ServiceCurrentState::Starting,
            DesiredState::Restart => ServiceCurrentState::Restarting,
            DesiredState::Pause => ServiceCurrentState::Pausing,
        }
    }

    /// State of a service that reached its desired state.
    pub fn settled(desired_state: DesiredState, emergency: bool) -> Self {
        match desired_state {
            DesiredState::Stop if emergency => ServiceCurrentState::EmergencyStopped,
            DesiredState::Stop => ServiceCurrentState::Stopped,
            DesiredState::Run | DesiredState::Restart => ServiceCurrentState::Running,
            DesiredState::Pause => ServiceCurrentState::Paused,
        }
    }

    /// True when a request for `desired_state` would change nothing.
    ///
    /// Only settled states count. A restart is never satisfied, and a plain
    /// stop is satisfied by an emergency stop but not the other way round.
    pub fn satisfies(&self, desired_state: DesiredState, emergency: bool) -> bool {
        match (desired_state, self) {
            (DesiredState::Stop, ServiceCurrentState::EmergencyStopped) => true,
            (DesiredState::Stop, ServiceCurrentState::Stopped) => !emergency,
            (DesiredState::Run, ServiceCurrentState::Running) => true,
            (DesiredState::Pause, ServiceCurrentState::Paused) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceCurrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DesiredState::Restart, "restart", -1)]
    #[case(DesiredState::Stop, "stop", 0)]
    #[case(DesiredState::Run, "go", 1)]
    #[case(DesiredState::Pause, "pause", 2)]
    fn test_desired_state_forms(#[case] state: DesiredState, #[case] s: &str, #[case] code: i32) {
        assert_eq!(state.as_str(), s);
        assert_eq!(state.as_i32(), code);
        assert_eq!(DesiredState::from_i32(code).unwrap(), state);
        assert_eq!(s.parse::<DesiredState>().unwrap(), state);
    }

    #[test]
    fn test_desired_state_serde_uses_string_form() {
        let json = serde_json::to_string(&DesiredState::Run).unwrap();
        assert_eq!(json, "\"go\"");
        let parsed: DesiredState = serde_json::from_str("\"pause\"").unwrap();
        assert_eq!(parsed, DesiredState::Pause);
    }

    #[test]
    fn test_restart_converges_as_run() {
        assert_eq!(DesiredState::Restart.convergence_target(), DesiredState::Run);
        assert_eq!(DesiredState::Pause.convergence_target(), DesiredState::Pause);
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(DesiredState::from_i32(7).is_err());
        assert!("sideways".parse::<DesiredState>().is_err());
    }

    #[rstest]
    #[case(DesiredState::Run, false, ServiceCurrentState::PendingStart, ServiceCurrentState::Starting, ServiceCurrentState::Running)]
    #[case(DesiredState::Restart, false, ServiceCurrentState::PendingRestart, ServiceCurrentState::Restarting, ServiceCurrentState::Running)]
    #[case(DesiredState::Stop, false, ServiceCurrentState::PendingStop, ServiceCurrentState::Stopping, ServiceCurrentState::Stopped)]
    #[case(DesiredState::Stop, true, ServiceCurrentState::PendingEmergencyStop, ServiceCurrentState::EmergencyStopping, ServiceCurrentState::EmergencyStopped)]
    #[case(DesiredState::Pause, false, ServiceCurrentState::PendingPause, ServiceCurrentState::Pausing, ServiceCurrentState::Paused)]
    fn test_current_state_phases(
        #[case] desired: DesiredState,
        #[case] emergency: bool,
        #[case] pending: ServiceCurrentState,
        #[case] transition: ServiceCurrentState,
        #[case] settled: ServiceCurrentState,
    ) {
        assert_eq!(ServiceCurrentState::pending(desired, emergency), pending);
        assert_eq!(ServiceCurrentState::transition(desired, emergency), transition);
        assert_eq!(ServiceCurrentState::settled(desired, emergency), settled);
    }

    #[rstest]
    #[case(ServiceCurrentState::Running, DesiredState::Run, false, true)]
    #[case(ServiceCurrentState::Starting, DesiredState::Run, false, false)]
    #[case(ServiceCurrentState::Running, DesiredState::Restart, false, false)]
    #[case(ServiceCurrentState::Stopped, DesiredState::Stop, false, true)]
    #[case(ServiceCurrentState::Stopped, DesiredState::Stop, true, false)]
    #[case(ServiceCurrentState::EmergencyStopped, DesiredState::Stop, false, true)]
    #[case(ServiceCurrentState::EmergencyStopped, DesiredState::Stop, true, true)]
    #[case(ServiceCurrentState::Paused, DesiredState::Pause, false, true)]
    #[case(ServiceCurrentState::Paused, DesiredState::Run, false, false)]
    #[case(ServiceCurrentState::Unknown, DesiredState::Stop, false, false)]
    fn test_current_state_satisfies(
        #[case] current: ServiceCurrentState,
        #[case] desired: DesiredState,
        #[case] emergency: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(current.satisfies(desired, emergency), expected);
    }
}
