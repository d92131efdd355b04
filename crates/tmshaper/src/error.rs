//! Error types for traffic-manager shaping and telemetry operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for tmshaper operations.
pub type TmResult<T> = Result<T, TmError>;

/// Errors that can occur while talking to the traffic manager.
#[derive(Debug, Error)]
pub enum TmError {
    /// The port-group mapping for an explicitly targeted port is unresolved.
    #[error("Failed to resolve pg_id for dev_port={dev_port}")]
    Resolution {
        /// The device port that could not be resolved.
        dev_port: u32,
    },

    /// A command-line value or combination is not acceptable.
    #[error("Invalid argument {arg}: {message}")]
    InvalidArgument {
        /// The offending argument.
        arg: String,
        /// Error message.
        message: String,
    },

    /// A table read or write was rejected by the control plane.
    #[error("Control plane {operation} on {table} failed: {message}")]
    ControlPlane {
        /// The operation that failed (e.g., "get", "mod", "set_pipe").
        operation: String,
        /// The table address.
        table: String,
        /// Error message reported by the control plane.
        message: String,
    },

    /// The bridge process sent something we could not understand.
    #[error("Bridge protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// The bridge process exited or closed its pipes.
    #[error("Bridge process unavailable: {message}")]
    BridgeUnavailable {
        /// Error message.
        message: String,
    },

    /// Local I/O failure (log file, console, bridge pipes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TmError {
    /// Creates a resolution error for a device port.
    pub fn resolution(dev_port: u32) -> Self {
        Self::Resolution { dev_port }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(arg: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg: arg.into(),
            message: message.into(),
        }
    }

    /// Creates a control plane error.
    pub fn control_plane(
        operation: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ControlPlane {
            operation: operation.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a bridge unavailable error.
    pub fn bridge_unavailable(message: impl Into<String>) -> Self {
        Self::BridgeUnavailable {
            message: message.into(),
        }
    }

    /// Returns true if this error is a caller-contract violation that was
    /// detected before touching hardware.
    pub fn is_usage(&self) -> bool {
        matches!(self, TmError::InvalidArgument { .. })
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on the next poll.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TmError::ControlPlane { .. } | TmError::Protocol { .. } | TmError::Json(_)
        )
    }
}
