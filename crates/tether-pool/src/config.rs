//! Pool-level configuration.

use serde::{Deserialize, Serialize};
use tether_mcp::ServerConfig;

use crate::balance::LoadBalanceStrategy;

fn default_max_connections() -> usize {
    10
}

fn default_connection_timeout() -> u64 {
    30_000
}

fn default_health_check_interval() -> u64 {
    30_000
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
///
/// ```toml
/// max_connections = 4
/// load_balance_strategy = "least-connections"
///
/// [[servers]]
/// name = "browser"
/// command = "npx"
/// args = ["browser-mcp"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Providers brought up by `initialize`.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound on connect plus handshake for one provider.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    /// Ping interval for ready connections; 0 disables health checks.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            load_balance_strategy: LoadBalanceStrategy::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_servers(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }
}
