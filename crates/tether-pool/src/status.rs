//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one pooled connection.
///
/// The happy path is `Disconnected → Connecting → Connected → Initializing →
/// Ready`. Any state may fall to `Error`; `Error` and `Disconnected` go
/// through `Reconnecting` before the next `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Error,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Disconnected, Connecting | Reconnecting) => true,
            (Error, Connecting | Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionStatus::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
