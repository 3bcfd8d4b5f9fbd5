//! Error taxonomy shared by the pool, mapper, session and orchestrator.
//!
//! Every layer returns structured outcomes; these enums carry the failure
//! *kind* across layer boundaries. The orchestrator flattens them into the
//! `error` field of a [`crate::outcome::WorkflowOutcome`] using the stable
//! [`WorkflowError::kind`] names, so hosts can match on them without parsing
//! free-form text.

use thiserror::Error;

/// A failure while opening a protocol session on an endpoint.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The OS or driver refused access to the device (busy, permissions).
    #[error("access denied opening {endpoint}: {reason}")]
    AccessDenied { endpoint: String, reason: String },

    /// The endpoint does not exist (unplugged between discovery and open).
    #[error("endpoint {endpoint} not found: {reason}")]
    NotFound { endpoint: String, reason: String },

    /// No handler is registered for the configured protocol name.
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The port configuration cannot be applied (bad speed, data pattern..).
    #[error("misconfigured session on {endpoint}: {reason}")]
    Misconfigured { endpoint: String, reason: String },
}

/// A failure reported by the configuration collaborator.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error in {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Workflow-level failure kinds, one per spec'd taxonomy entry.
///
/// The orchestrator never panics for these; they end up as the `error`
/// string of the outcome via [`WorkflowError::kind`].
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Coordinate references a BIB/UUT/port that is not declared.
    #[error("ConfigurationMissing: {0}")]
    ConfigurationMissing(String),

    /// Protocol name has no registered handler.
    #[error("UnsupportedProtocol: {0}")]
    UnsupportedProtocol(String),

    /// No chip matches the BIB's mapping rule, or channel out of range.
    #[error("ResolutionFailed: {0}")]
    ResolutionFailed(String),

    /// No endpoint satisfies the validation policy.
    #[error("ValidationRejected: {0}")]
    ValidationRejected(String),

    /// Endpoint not available (already leased or rejected by validation).
    #[error("ReservationFailed: {0}")]
    ReservationFailed(String),

    /// OS/driver refused the open.
    #[error("SessionOpenFailed: {0}")]
    SessionOpenFailed(String),

    /// IO failure or read timeout during a command.
    #[error("CommandExecutionError: {0}")]
    CommandExecutionError(String),

    /// Cooperative cancellation observed.
    #[error("Cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Stable kind name, used as the `error` field of outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::ConfigurationMissing(_) => "ConfigurationMissing",
            WorkflowError::UnsupportedProtocol(_) => "UnsupportedProtocol",
            WorkflowError::ResolutionFailed(_) => "ResolutionFailed",
            WorkflowError::ValidationRejected(_) => "ValidationRejected",
            WorkflowError::ReservationFailed(_) => "ReservationFailed",
            WorkflowError::SessionOpenFailed(_) => "SessionOpenFailed",
            WorkflowError::CommandExecutionError(_) => "CommandExecutionError",
            WorkflowError::Cancelled => "Cancelled",
        }
    }
}

impl From<OpenError> for WorkflowError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::UnsupportedProtocol(name) => WorkflowError::UnsupportedProtocol(name),
            other => WorkflowError::SessionOpenFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(
            WorkflowError::ConfigurationMissing("x".into()).kind(),
            "ConfigurationMissing"
        );
        assert_eq!(WorkflowError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn open_error_maps_to_workflow_kind() {
        let err: WorkflowError = OpenError::UnsupportedProtocol("rs485".into()).into();
        assert_eq!(err.kind(), "UnsupportedProtocol");

        let err: WorkflowError = OpenError::NotFound {
            endpoint: "COM9".into(),
            reason: "gone".into(),
        }
        .into();
        assert_eq!(err.kind(), "SessionOpenFailed");
    }
}
