//! Connection pool for tool providers.
//!
//! A [`ConnectionManager`] keeps one [`McpClient`](tether_mcp::McpClient) per
//! configured provider, reconnects lost providers with exponential backoff,
//! pings ready ones on an interval, and routes tool calls through a merged
//! tool registry using a load-balancing strategy.

pub mod backoff;
pub mod balance;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod status;

pub use backoff::ReconnectPolicy;
pub use balance::LoadBalanceStrategy;
pub use config::PoolConfig;
pub use error::PoolError;
pub use events::ManagerEvent;
pub use manager::{
    ConnectionManager, ConnectionSnapshot, HealthReport, InitReport, PoolStatus, ToolCallOutcome,
};
pub use registry::{RegistryEntry, ToolRegistry};
pub use status::ConnectionStatus;
