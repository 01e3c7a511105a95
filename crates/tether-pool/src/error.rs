use tether_mcp::McpError;

use crate::status::ConnectionStatus;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection '{name}' already exists")]
    DuplicateConnection { name: String },

    #[error("Connection pool is full ({max} connections)")]
    PoolFull { max: usize },

    #[error("Unknown connection '{name}'")]
    UnknownConnection { name: String },

    #[error("No ready connection provides tool '{tool}'")]
    NoProvider { tool: String },

    #[error("Connecting to '{name}' timed out after {timeout_ms}ms")]
    ConnectTimeout { name: String, timeout_ms: u64 },

    #[error("Connection '{name}' is {status}")]
    Busy {
        name: String,
        status: ConnectionStatus,
    },

    #[error("Connection '{name}' was restarted while connecting")]
    Superseded { name: String },

    #[error("Connection manager is shut down")]
    ShuttingDown,

    #[error("Provider '{connection}' failed: {source}")]
    Provider {
        connection: String,
        #[source]
        source: McpError,
    },
}

impl PoolError {
    /// Name of the connection the error belongs to, if any.
    pub fn connection(&self) -> Option<&str> {
        match self {
            PoolError::DuplicateConnection { name }
            | PoolError::UnknownConnection { name }
            | PoolError::ConnectTimeout { name, .. }
            | PoolError::Busy { name, .. }
            | PoolError::Superseded { name } => Some(name),
            PoolError::Provider { connection, .. } => Some(connection),
            PoolError::PoolFull { .. } | PoolError::NoProvider { .. } | PoolError::ShuttingDown => {
                None
            }
        }
    }

    /// The operation lost a race with another change to the connection, so
    /// retrying it is pointless.
    pub(crate) fn is_stale(&self) -> bool {
        matches!(
            self,
            PoolError::UnknownConnection { .. }
                | PoolError::Superseded { .. }
                | PoolError::Busy { .. }
                | PoolError::ShuttingDown
        )
    }
}
