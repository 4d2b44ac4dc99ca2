//! Error taxonomy for the participation agent

use crate::state::SessionState;
use packet_proto::CodecError;
use thiserror::Error;

/// Errors returned synchronously by `Agent::initialize`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Application key cannot be empty")]
    EmptyAppKey,

    #[error("Application key contains whitespace or control characters")]
    InvalidAppKey,

    #[error("Agent already initialized")]
    AlreadyInitialized,

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

/// Operation is not legal in the current session state
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Cannot {operation} while agent is {state}")]
pub struct InvalidStateError {
    pub operation: &'static str,
    pub state: SessionState,
}

/// Network failures, each retryable sub-kind distinct
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("TLS failure with {endpoint}: {reason}")]
    TlsFailure { endpoint: String, reason: String },

    #[error("DNS resolution failed for {endpoint}: {reason}")]
    DnsFailure { endpoint: String, reason: String },

    #[error("IO error with {endpoint}: {source}")]
    Io {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected by control server: {0}")]
    Rejected(String),
}

impl NetworkError {
    /// Rejection is a decision by the server, not a transient fault
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetworkError::Rejected(_))
    }
}

impl From<CodecError> for NetworkError {
    fn from(err: CodecError) -> Self {
        NetworkError::Protocol(err.to_string())
    }
}

/// Errors from the traffic relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error("Assignment {0} is already active")]
    Duplicate(String),

    #[error("Relay capacity exceeded ({0} active)")]
    CapacityExceeded(usize),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("IO error during relay: {0}")]
    Io(#[from] std::io::Error),
}

/// Options file loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read options file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse options file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
