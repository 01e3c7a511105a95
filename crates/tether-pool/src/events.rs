//! Events published by the connection manager.

use crate::status::ConnectionStatus;

/// Subscribe with [`ConnectionManager::subscribe`](crate::ConnectionManager::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    StatusChanged {
        name: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    ConnectionAdded {
        name: String,
    },
    ConnectionRemoved {
        name: String,
    },
    /// The tool registry was rebuilt.
    RegistryChanged {
        tool_count: usize,
    },
    /// A provider announced its resource list changed.
    ResourcesChanged {
        name: String,
    },
    ReconnectScheduled {
        name: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Retry budget spent; the connection stays in `error`.
    ReconnectExhausted {
        name: String,
        attempts: u32,
    },
}
