//! Client runtime for JSON-RPC tool providers (MCP).
//!
//! Providers are reached over a child process speaking newline-delimited
//! JSON-RPC 2.0 on stdin/stdout, over HTTP (one POST per message), or
//! in-process. An [`McpClient`] owns one connection: it correlates responses
//! to requests by id, enforces per-request timeouts, publishes provider
//! notifications, and performs the initialize handshake.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod memory;
pub mod stdio;
pub mod transport;

pub use client::{
    ClientEvent, InitializeParams, InitializeResult, McpClient, PROTOCOL_VERSION, ToolInfo,
};
pub use config::{ServerConfig, TransportKind};
pub use error::McpError;
pub use jsonrpc::JsonRpcError;
pub use memory::{InProcessFactory, InProcessProvider, Reply};
pub use transport::{DefaultTransportFactory, Transport, TransportEvent, TransportFactory};
