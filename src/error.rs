//! Error types for the iOS WebKit adapter.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ios_webkit_adapter::{Result, Target};
//!
//! async fn stylesheet(target: &Target, id: &str) -> Result<serde_json::Value> {
//!     target
//!         .call_target("CSS.getStyleSheet", serde_json::json!({ "styleSheetId": id }))
//!         .await
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::ExecutableNotFound`] |
//! | Process | [`Error::ProcessLaunchFailed`], [`Error::ProcessAlreadyRunning`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::AlreadyConnected`] |
//! | Protocol | [`Error::Protocol`], [`Error::Remote`], [`Error::RequestTimeout`] |
//! | Routing | [`Error::TargetNotFound`], [`Error::AdapterNotFound`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when adapter options cannot be turned into a usable endpoint.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// A helper executable could not be located on `PATH`.
    #[error("{name} not found: {hint}")]
    ExecutableNotFound {
        /// Executable name that was looked up.
        name: String,
        /// Installation hint.
        hint: String,
    },

    // ========================================================================
    // Process Errors
    // ========================================================================
    /// Failed to launch the device proxy process.
    #[error("Failed to launch proxy process: {message}")]
    ProcessLaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    /// The device proxy process is already starting or running.
    #[error("Proxy process already started (pid {pid})")]
    ProcessAlreadyRunning {
        /// Process ID of the running child.
        pid: u32,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Device-side connection closed while a call was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A target already owns a device-side connection.
    #[error("Target {target_id} is already connected")]
    AlreadyConnected {
        /// The target that rejected the second connection.
        target_id: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// The device answered an adapter-issued call with an error object.
    #[error("Device returned an error: {error}")]
    Remote {
        /// The raw `error` member of the reply.
        error: Value,
    },

    /// Adapter-issued call was not answered in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// Target id was never seen in discovery, or its device went away.
    #[error("Target not found: {target_id}")]
    TargetNotFound {
        /// The unknown target id or route.
        target_id: String,
    },

    /// No sub-adapter owns the requested route.
    #[error("Adapter not found: {adapter_id}")]
    AdapterNotFound {
        /// The unknown adapter id.
        adapter_id: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP discovery error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an executable not found error.
    #[inline]
    pub fn executable_not_found(name: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::ExecutableNotFound {
            name: name.into(),
            hint: hint.into(),
        }
    }

    /// Creates a process launch failed error.
    #[inline]
    pub fn process_launch_failed(message: impl Into<String>) -> Self {
        Self::ProcessLaunchFailed {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an already connected error.
    #[inline]
    pub fn already_connected(target_id: impl Into<String>) -> Self {
        Self::AlreadyConnected {
            target_id: target_id.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a remote error from a device reply.
    #[inline]
    pub fn remote(error: Value) -> Self {
        Self::Remote { error }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a target not found error.
    #[inline]
    pub fn target_not_found(target_id: impl Into<String>) -> Self {
        Self::TargetNotFound {
            target_id: target_id.into(),
        }
    }

    /// Creates an adapter not found error.
    #[inline]
    pub fn adapter_not_found(adapter_id: impl Into<String>) -> Self {
        Self::AdapterNotFound {
            adapter_id: adapter_id.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::AlreadyConnected { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the error names an unknown target or adapter.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TargetNotFound { .. } | Self::AdapterNotFound { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_already_connected_display() {
        let err = Error::already_connected("page/1");
        assert_eq!(err.to_string(), "Target page/1 is already connected");
    }

    #[test]
    fn test_remote_error_keeps_payload() {
        let err = Error::remote(json!({ "code": -32601, "message": "nope" }));
        match err {
            Error::Remote { error } => assert_eq!(error["code"], -32601),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::request_timeout(RequestId::new(-3), 30_000);
        let other_err = Error::protocol("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::already_connected("x").is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::target_not_found("page/1").is_not_found());
        assert!(Error::adapter_not_found("/ios/abc").is_not_found());
        assert!(!Error::ConnectionClosed.is_not_found());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_websocket_error() {
        let err: Error = WsError::ConnectionClosed.into();
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
