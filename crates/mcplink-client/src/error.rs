//! Error taxonomy for the client.
//!
//! Errors split into two propagation classes: failures on the dispatcher
//! read path (transport loss, undecodable frames) are fatal to the
//! connection and fail every pending call with `ConnectionClosed`, while
//! per-call failures (validation, timeout, tool errors) stay local to the
//! caller that hit them.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur at the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the server process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to connect to a remote endpoint.
    #[error("failed to connect: {0}")]
    ConnectFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    Write(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    Read(std::io::Error),

    /// Transport closed unexpectedly.
    #[error("transport closed")]
    Closed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,
}

/// Errors produced while decoding an incoming frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame is not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame exceeds the maximum allowed length.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame is valid JSON but not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Frame declares an unsupported JSON-RPC version.
    #[error("unsupported JSON-RPC version: {0:?}")]
    BadRpcVersion(Option<String>),

    /// Frame does not match any known message shape.
    #[error("frame is neither a request, response nor notification")]
    UnknownShape,

    /// Response carries both a result and an error, or neither.
    #[error("response must carry exactly one of result or error")]
    AmbiguousResponse,
}

/// Fatal handshake failures. A connection that hits one of these goes
/// straight to `Closed` without ever becoming usable.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Server declared a protocol version this client cannot speak.
    #[error("unsupported protocol version {server} (supported: {supported})")]
    VersionMismatch { server: String, supported: String },

    /// Server rejected the initialize request.
    #[error("server rejected initialization (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Handshake response did not deserialize into the expected shape.
    #[error("malformed handshake response: {0}")]
    MalformedResponse(String),
}

/// Remote tool failure, carrying whatever the server supplied.
#[derive(Debug, Error)]
#[error("tool failed{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct ToolError {
    /// Remote-supplied error code, when the failure came back as a
    /// JSON-RPC error object.
    pub code: Option<i64>,
    /// Remote-supplied message.
    pub message: String,
    /// Remote-supplied additional data.
    pub data: Option<Value>,
}

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Incoming frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Handshake failed; the connection never became usable.
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Arguments failed the local schema check; nothing was sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// No response arrived within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote tool reported a failure.
    #[error("{0}")]
    Tool(#[from] ToolError),

    /// Server returned a JSON-RPC error for a non-tool request.
    #[error("server error (code {code}): {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Requested tool is not in the negotiated capability set.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Operation attempted on, or interrupted by, a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation requires a different session state.
    #[error("invalid session state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    /// JSON serialization failure on the outgoing path.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a server error from a JSON-RPC error object.
    pub fn server(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Server {
            code,
            message: message.into(),
            data,
        }
    }

    /// Whether this error is fatal to the connection as a whole, as
    /// opposed to local to one call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Decode(_) | Self::Negotiation(_) | Self::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError {
            code: Some(-32000),
            message: "city not found".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "tool failed (code -32000): city not found");

        let err = ToolError {
            code: None,
            message: "city not found".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "tool failed: city not found");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::ConnectionClosed.is_connection_fatal());
        assert!(ClientError::Transport(TransportError::Closed).is_connection_fatal());
        assert!(!ClientError::validation("bad args").is_connection_fatal());
        assert!(!ClientError::Timeout(Duration::from_secs(30)).is_connection_fatal());
    }

    #[test]
    fn test_negotiation_error_display() {
        let err = NegotiationError::VersionMismatch {
            server: "1999-01-01".to_string(),
            supported: "2024-11-05".to_string(),
        };
        assert!(err.to_string().contains("1999-01-01"));
    }
}
