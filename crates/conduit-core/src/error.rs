//! Error types for Conduit.
//!
//! One error enum covers the supervisor, the transport channels, the router
//! and the orchestrator so failures can cross component boundaries without
//! re-wrapping.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Conduit library.
#[derive(Debug, Error)]
pub enum ConduitError {
    // Capacity and identity errors
    #[error("Capacity exceeded: limit of {limit} {what} reached")]
    CapacityExceeded { what: String, limit: usize },

    #[error("Duplicate id: {id}")]
    DuplicateId { id: String },

    // Lookup errors
    #[error("Process not found: {id}")]
    ProcessNotFound { id: String },

    #[error("Server not found: {id}")]
    ServerNotFound { id: String },

    #[error("Correlation not found: {id}")]
    CorrelationNotFound { id: String },

    #[error("No route from {source_id} to {destination}")]
    RouteNotFound {
        source_id: String,
        destination: String,
    },

    #[error("Unknown transport: {kind}")]
    UnknownTransport { kind: String },

    // Routing errors
    #[error("Message from {source_id} to {destination} rejected by route filter")]
    MessageFiltered {
        source_id: String,
        destination: String,
    },

    // Connection errors
    #[error("Channel not connected: {channel}")]
    NotConnected { channel: String },

    #[error("Transport failure: {message}")]
    TransportFailure { message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // Process errors
    #[error("Failed to spawn {command}: {message}")]
    SpawnFailure {
        command: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Server not running: {id}")]
    ServerNotRunning { id: String },

    #[error("Invalid state for {id}: {message}")]
    InvalidState { id: String, message: String },

    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ConduitError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ConduitError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport failure from any displayable cause.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        ConduitError::TransportFailure {
            message: message.to_string(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error or timeout
    /// - -32001: Process, server, correlation or transport kind not found
    /// - -32002: Routing error (no route, filtered)
    /// - -32003: Process lifecycle failure
    /// - -32004: Cancelled
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ConduitError::NotConnected { .. }
            | ConduitError::TransportFailure { .. }
            | ConduitError::Timeout(_) => -32000,

            ConduitError::ProcessNotFound { .. }
            | ConduitError::ServerNotFound { .. }
            | ConduitError::CorrelationNotFound { .. }
            | ConduitError::UnknownTransport { .. } => -32001,

            ConduitError::RouteNotFound { .. } | ConduitError::MessageFiltered { .. } => -32002,

            ConduitError::SpawnFailure { .. }
            | ConduitError::CapacityExceeded { .. }
            | ConduitError::ServerNotRunning { .. }
            | ConduitError::InvalidState { .. } => -32003,

            ConduitError::Cancelled => -32004,

            ConduitError::Validation { .. }
            | ConduitError::DuplicateId { .. }
            | ConduitError::Config { .. } => -32005,

            ConduitError::InvalidParams { .. } => -32602,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Check if this error should trigger a retry by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConduitError::Timeout(_)
                | ConduitError::NotConnected { .. }
                | ConduitError::TransportFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConduitError::RouteNotFound {
            source_id: "api".into(),
            destination: "worker".into(),
        };
        assert_eq!(err.to_string(), "No route from api to worker");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            ConduitError::ProcessNotFound { id: "p1".into() }.to_rpc_error_code(),
            -32001
        );
        assert_eq!(ConduitError::Cancelled.to_rpc_error_code(), -32004);
        assert_eq!(
            ConduitError::Timeout(Duration::from_secs(1)).to_rpc_error_code(),
            -32000
        );
        assert_eq!(ConduitError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ConduitError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(ConduitError::NotConnected {
            channel: "c1".into()
        }
        .is_retryable());
        assert!(!ConduitError::DuplicateId { id: "p1".into() }.is_retryable());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: ConduitError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
