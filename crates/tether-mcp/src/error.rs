//! Error types for the protocol engine and its transports.

use crate::protocol::{RequestId, RpcError};
use thiserror::Error;

/// Result type for engine and session operations.
pub type McpResult<T> = Result<T, McpError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced to callers of the engine, client and server.
#[derive(Debug, Error)]
pub enum McpError {
    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote peer answered with an error response.
    #[error("Remote error: {0}")]
    Rpc(#[from] RpcError),

    /// The request deadline elapsed before a response arrived.
    #[error("Request {0} timed out")]
    Timeout(RequestId),

    /// The caller cancelled the request.
    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    /// The connection closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer did not advertise a capability the method needs.
    #[error("Capability '{capability}' is not supported (required by {method})")]
    CapabilityNotSupported { capability: String, method: String },

    /// A request was attempted before the handshake completed.
    #[error("Session is not initialized, cannot send {0}")]
    NotInitialized(String),

    /// The caller broke a usage contract (e.g. late capability registration).
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The peer sent something the protocol does not allow.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Engine is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a contract violation error.
    pub fn contract(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }

    /// Create a capability error for `method`.
    pub fn capability_not_supported(capability: impl Into<String>, method: impl Into<String>) -> Self {
        Self::CapabilityNotSupported {
            capability: capability.into(),
            method: method.into(),
        }
    }

    /// Whether this outcome only affects one request and leaves the connection usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::Timeout(_) | Self::Cancelled(_) | Self::Json(_)
        )
    }
}

/// Transport-level failures. These never go on the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer refused the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connecting or flushing took too long.
    #[error("Transport timeout")]
    Timeout,

    /// The connection handshake (WebSocket upgrade, HTTP status) failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A frame type the transport does not carry (e.g. WebSocket binary).
    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),

    /// No pong arrived within two heartbeat intervals.
    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    /// Missing or unknown session id.
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// An inbound frame exceeded the configured limit.
    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// The byte stream cannot be split into frames any more.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The transport is closed or was never started.
    #[error("Transport closed")]
    Closed,

    /// HTTP-level failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO failure.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => Self::Closed,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// JSON-RPC numeric error codes used by this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Unauthorized,
    Forbidden,
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::Unauthorized => -32001,
            ErrorCode::Forbidden => -32002,
        }
    }

    /// Look up a code by its wire value.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32001 => Some(ErrorCode::Unauthorized),
            -32002 => Some(ErrorCode::Forbidden),
            _ => None,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::Forbidden => "Forbidden",
        }
    }
}

/// Error returned by application request handlers.
///
/// Typed protocol errors are sent as-is; anything else becomes `InternalError`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::invalid_params(message))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::Rpc(RpcError::method_not_found(method))
    }

    /// Convert into the error object placed on the wire.
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            HandlerError::Rpc(error) => error,
            HandlerError::Internal(error) => RpcError::internal_error(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (McpError::ConnectionClosed, "Connection closed"),
            (
                McpError::Timeout(RequestId::Number(7)),
                "Request 7 timed out",
            ),
            (
                McpError::Cancelled(RequestId::String("abc".to_string())),
                "Request abc was cancelled",
            ),
            (
                McpError::capability_not_supported("tools", "tools/list"),
                "Capability 'tools' is not supported (required by tools/list)",
            ),
            (
                McpError::NotInitialized("tools/list".to_string()),
                "Session is not initialized, cannot send tools/list",
            ),
            (
                McpError::Transport(TransportError::HeartbeatTimeout),
                "Transport error: Heartbeat timeout",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_error_codes_round_trip() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(-1), None);
        assert_eq!(ErrorCode::Unauthorized.code(), -32001);
        assert_eq!(ErrorCode::Forbidden.code(), -32002);
    }

    #[test]
    fn test_handler_error_conversion() {
        let internal = HandlerError::from(anyhow::anyhow!("disk on fire"));
        let rpc = internal.into_rpc_error();
        assert_eq!(rpc.code, ErrorCode::InternalError.code());
        assert!(rpc.message.contains("disk on fire"));

        let typed = HandlerError::invalid_params("missing name");
        assert_eq!(typed.into_rpc_error().code, -32602);

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(HandlerError::from(json_err).into_rpc_error().code, -32602);
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            TransportError::from(refused),
            TransportError::ConnectionRefused(_)
        ));

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(TransportError::from(pipe), TransportError::Closed);
    }

    #[test]
    fn test_recoverable() {
        assert!(McpError::Timeout(RequestId::Number(1)).is_recoverable());
        assert!(McpError::Cancelled(RequestId::Number(1)).is_recoverable());
        assert!(!McpError::ConnectionClosed.is_recoverable());
    }
}
