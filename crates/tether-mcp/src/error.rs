//! Error types for provider communication.

use thiserror::Error;

/// Errors from talking to a single tool provider.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Provider '{name}' is already connected")]
    AlreadyConnected { name: String },

    #[error("Provider '{name}' is not connected")]
    NotConnected { name: String },

    #[error("Provider '{name}' has not completed the initialize handshake")]
    NotInitialized { name: String },

    #[error("Failed to spawn provider '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Provider '{name}' exited during startup: {reason}")]
    ProcessStart { name: String, reason: String },

    #[error("Transport error on '{name}': {message}")]
    Transport { name: String, message: String },

    #[error("Request timeout after {timeout_ms}ms ({method} on '{name}')")]
    Timeout {
        name: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Provider '{name}' disconnected before '{method}' completed")]
    Disconnected { name: String, method: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid provider configuration for '{name}': {message}")]
    InvalidConfig { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Whether this error means the connection itself is gone, as opposed to a
    /// single failed request.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            McpError::NotConnected { .. }
                | McpError::Disconnected { .. }
                | McpError::Transport { .. }
        )
    }
}
