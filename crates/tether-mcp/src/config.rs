//! Configuration types for a single tool provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::McpError;

fn default_timeout() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// How the client reaches a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON on stdin/stdout.
    #[default]
    Stdio,
    /// One POST per message to a fixed URL.
    Http,
}

/// Configuration for a single provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique connection name.
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to run (stdio only).
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the provider process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for the http transport.
    #[serde(default)]
    pub url: Option<String>,
    /// Per-request timeout in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Reconnect attempts before the connection is left in `error`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential reconnect backoff.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Upper bound on a single reconnect delay.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl ServerConfig {
    /// A stdio provider spawned from `command`.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::base(name.into(), TransportKind::Stdio)
        }
    }

    /// An http provider at `url`.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::base(name.into(), TransportKind::Http)
        }
    }

    fn base(name: String, transport: TransportKind) -> Self {
        Self {
            name,
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            timeout_ms: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            auto_reconnect: true,
        }
    }

    /// Check that the fields required by the chosen transport are present.
    pub fn validate(&self) -> Result<(), McpError> {
        let missing = match self.transport {
            TransportKind::Stdio if self.command.as_deref().is_none_or(str::is_empty) => {
                Some("stdio transport requires `command`")
            }
            TransportKind::Http if self.url.as_deref().is_none_or(str::is_empty) => {
                Some("http transport requires `url`")
            }
            _ => None,
        };
        match missing {
            Some(message) => Err(McpError::InvalidConfig {
                name: self.name.clone(),
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }
}
