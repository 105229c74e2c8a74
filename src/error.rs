//! Error types for the MCP proxy router

use std::io;

use thiserror::Error;

/// Result type alias for the MCP proxy router
pub type Result<T> = std::result::Result<T, Error>;

/// MCP proxy router errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server not found in catalog or active set
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Server is known but cannot serve requests right now
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// Request deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport error (spawn failure, closed pipe, HTTP failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error (handshake failure, malformed envelope)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No route for a tool name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No route for a prompt name
    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    /// No route for a resource URI
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// JSON-RPC error relayed from a backend
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => -32700,     // Parse error
            Self::Protocol(_) => -32600, // Invalid request
            Self::UnknownTool(_) | Self::UnknownPrompt(_) | Self::UnknownResource(_) => -32601,
            Self::ServerNotFound(_) => -32001,
            Self::ServerUnavailable(_) | Self::Timeout(_) | Self::Transport(_) => -32000,
            _ => -32603, // Internal error
        }
    }

    /// Whether this error means the downstream connection died mid-call.
    ///
    /// Transport failures and the JSON-RPC server-error family (-32000..-32099)
    /// qualify; they trigger the reconnect-and-retry path in the backend
    /// client. Timeouts do not - the waiter is dropped and the timeout
    /// surfaces as-is.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::JsonRpc { code, .. } => {
                (rpc_codes::SERVER_ERROR_END..=rpc_codes::SERVER_ERROR_START).contains(code)
            }
            _ => false,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
    /// Unauthorized (upstream bearer gate)
    pub const UNAUTHORIZED: i32 = -32001;
}
