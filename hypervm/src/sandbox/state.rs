//! Sandbox lifecycle status and state machine.
//!
//! Defines the possible states of a sandbox and valid transitions between
//! them.

use serde::{Deserialize, Serialize};

use hypervm_shared::{VmError, VmResult};

/// Lifecycle status of a sandbox.
///
/// Exactly one lifecycle per sandbox:
/// `Init → Starting → Running ↔ Paused → Cleaning → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Context constructed, VM not launched yet.
    Init,

    /// Hypervisor launched, waiting for the guest init and the device plan.
    Starting,

    /// Guest init serving, pod running.
    Running,

    /// vcpus frozen; only save and resume are accepted.
    Paused,

    /// Tearing down: devices ejected in reverse order, best effort.
    Cleaning,

    /// Final state. The response stream is closed after the terminal
    /// response.
    Terminated,
}

impl SandboxStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SandboxStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Terminated)
    }

    /// Whether structural mutations (device add/remove) are accepted.
    pub fn accepts_mutations(&self) -> bool {
        matches!(self, SandboxStatus::Starting | SandboxStatus::Running)
    }

    /// Whether the guest agent is expected to be reachable.
    pub fn agent_alive(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Starting | SandboxStatus::Running | SandboxStatus::Paused
        )
    }

    pub fn can_transition_to(&self, target: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, target),
            (Init, Starting)
                | (Init, Cleaning)
                | (Starting, Running)
                | (Starting, Cleaning)
                | (Running, Paused)
                | (Running, Cleaning)
                | (Paused, Running)
                | (Paused, Cleaning)
                | (Cleaning, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Init => "init",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Cleaning => "cleaning",
            SandboxStatus::Terminated => "terminated",
        }
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(SandboxStatus::Init),
            "starting" => Ok(SandboxStatus::Starting),
            "running" => Ok(SandboxStatus::Running),
            "paused" => Ok(SandboxStatus::Paused),
            "cleaning" => Ok(SandboxStatus::Cleaning),
            "terminated" => Ok(SandboxStatus::Terminated),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status cell with transition validation.
#[derive(Debug, Clone)]
pub struct SandboxState {
    status: SandboxStatus,
}

impl SandboxState {
    pub fn new() -> Self {
        Self {
            status: SandboxStatus::Init,
        }
    }

    pub fn restored(status: SandboxStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> SandboxStatus {
        self.status
    }

    pub fn transition_to(&mut self, target: SandboxStatus) -> VmResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(VmError::DriverFail(format!(
                "invalid sandbox transition {} -> {}",
                self.status, target
            )));
        }
        tracing::debug!(from = %self.status, to = %target, "sandbox state change");
        self.status = target;
        Ok(())
    }
}

impl Default for SandboxState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_valid() {
        let mut state = SandboxState::new();
        state.transition_to(SandboxStatus::Starting).unwrap();
        state.transition_to(SandboxStatus::Running).unwrap();
        state.transition_to(SandboxStatus::Paused).unwrap();
        state.transition_to(SandboxStatus::Running).unwrap();
        state.transition_to(SandboxStatus::Cleaning).unwrap();
        state.transition_to(SandboxStatus::Terminated).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!SandboxStatus::Init.can_transition_to(SandboxStatus::Running));
        assert!(!SandboxStatus::Starting.can_transition_to(SandboxStatus::Paused));
        assert!(!SandboxStatus::Paused.can_transition_to(SandboxStatus::Terminated));
        assert!(!SandboxStatus::Terminated.can_transition_to(SandboxStatus::Starting));
        assert!(!SandboxStatus::Cleaning.can_transition_to(SandboxStatus::Running));
    }

    #[test]
    fn test_failed_transition_leaves_state_unchanged() {
        let mut state = SandboxState::new();
        assert!(state.transition_to(SandboxStatus::Running).is_err());
        assert_eq!(state.status(), SandboxStatus::Init);
    }

    #[test]
    fn test_cleaning_reachable_from_everywhere_live() {
        for status in [
            SandboxStatus::Init,
            SandboxStatus::Starting,
            SandboxStatus::Running,
            SandboxStatus::Paused,
        ] {
            assert!(status.can_transition_to(SandboxStatus::Cleaning));
        }
    }

    #[test]
    fn test_predicates() {
        assert!(SandboxStatus::Running.accepts_mutations());
        assert!(SandboxStatus::Starting.accepts_mutations());
        assert!(!SandboxStatus::Paused.accepts_mutations());
        assert!(!SandboxStatus::Cleaning.accepts_mutations());
        assert!(SandboxStatus::Paused.agent_alive());
        assert!(SandboxStatus::Terminated.is_terminal());
    }

    #[test]
    fn test_round_trip_strings() {
        for status in [
            SandboxStatus::Init,
            SandboxStatus::Starting,
            SandboxStatus::Running,
            SandboxStatus::Paused,
            SandboxStatus::Cleaning,
            SandboxStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<SandboxStatus>(), Ok(status));
        }
    }
}
