//! Error types used across the hypervm runtime.

use thiserror::Error;

/// Result type for hypervm operations.
pub type VmResult<T> = Result<T, VmError>;

/// Error kinds surfaced by the sandbox core.
///
/// Each variant maps to one externally visible failure kind; the event loop
/// translates kinds into outbound response codes.
#[derive(Debug, Error)]
pub enum VmError {
    /// Malformed input, duplicate id, or unknown target. Non-fatal.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Another structural operation is in flight on the same resource.
    /// Non-fatal, retryable.
    #[error("resource busy: {0}")]
    Busy(String),

    /// An event arrived in a state that does not accept it.
    #[error("unexpected event {event} during {state}")]
    Unexpected { state: String, event: String },

    /// The hypervisor refused an operation or crashed.
    #[error("hypervisor driver failure: {0}")]
    DriverFail(String),

    /// I/O error or ERROR reply from the guest init.
    #[error("guest agent failure: {0}")]
    AgentFail(String),

    /// A request exceeded its deadline. The underlying operation may still
    /// complete; late replies are discarded.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A resource operation was cancelled because the sandbox is going away.
    #[error("operation interrupted: {0}")]
    Interrupted(String),

    /// The sandbox is not in a state that allows the operation.
    #[error("sandbox not ready: {0}")]
    NotReady(String),

    /// Wire framing or payload encoding failure. Poisons the agent channel.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Whether the error terminates the sandbox when it occurs during
    /// startup or teardown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::DriverFail(_) | VmError::Codec(_) | VmError::Io(_)
        )
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::Codec(format!("JSON error: {}", err))
    }
}

impl From<String> for VmError {
    fn from(err: String) -> Self {
        VmError::BadRequest(err)
    }
}

impl From<&str> for VmError {
    fn from(err: &str) -> Self {
        VmError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(VmError::DriverFail("qmp".into()).is_fatal());
        assert!(VmError::Codec("short frame".into()).is_fatal());
        assert!(!VmError::Busy("nic eth1".into()).is_fatal());
        assert!(!VmError::Timeout("writefile".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = VmError::Unexpected {
            state: "running".into(),
            event: "InitConnected".into(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected event InitConnected during running"
        );
    }
}
