//! Error types for the Volley orchestrator

use thiserror::Error;

/// Main error type for Volley operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid topology or cluster specification. Raised before any cloud
    /// resource is allocated, so no teardown is required.
    #[error("config error: {0}")]
    Config(String),

    /// A cloud resource creation request failed. Whatever was allocated
    /// before the failure is handed to the teardown sequencer.
    #[error("provision error: {0}")]
    Provision(String),

    /// An instance left the pending/running lifecycle unexpectedly while the
    /// run was waiting for the fleet to come up.
    #[error("instance {id} failed: {reason}")]
    InstanceFailure {
        /// Cloud-assigned identifier of the failed instance
        id: String,
        /// Provider-reported reason for the state transition
        reason: String,
    },

    /// The deployment tool returned a non-zero exit code. The code is
    /// surfaced verbatim as the run's exit code.
    #[error("deployment tool exited with code {0}")]
    Deployment(i32),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provision error with the given message
    pub fn provision(msg: impl Into<String>) -> Self {
        Self::Provision(msg.into())
    }

    /// Create an instance-failure error for the given instance
    pub fn instance_failure(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstanceFailure {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_carry_message() {
        let err = Error::config("cluster name 'hq' is reserved");
        assert!(err.to_string().contains("config error"));
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn provision_errors_carry_message() {
        let err = Error::provision("create subnet failed: quota exceeded");
        assert!(err.to_string().contains("provision error"));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn instance_failure_names_the_instance() {
        let err = Error::instance_failure("i-0042", "Server.InternalError");
        assert!(err.to_string().contains("i-0042"));
        assert!(err.to_string().contains("Server.InternalError"));
        match err {
            Error::InstanceFailure { id, reason } => {
                assert_eq!(id, "i-0042");
                assert_eq!(reason, "Server.InternalError");
            }
            _ => panic!("expected InstanceFailure variant"),
        }
    }

    #[test]
    fn deployment_error_carries_exit_code() {
        let err = Error::Deployment(2);
        assert!(err.to_string().contains("code 2"));
    }
}
