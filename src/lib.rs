//! MCP Switchboard manages the connection lifecycle for Model Context
//! Protocol servers: local subprocesses speaking JSON-RPC over stdio and
//! remote servers speaking streamed HTTP/SSE.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`transport`] is the raw channel: process stdio or HTTP POST plus an
//!   SSE push stream, delivering decoded messages on an event channel.
//! - [`connection`] owns the per-server state machine: handshake,
//!   request/response correlation, timeouts, and reconnection with
//!   exponential backoff.
//! - [`connector`] is the uniform call surface over a connection,
//!   independent of the transport kind behind it.
//! - [`registry`] maps server ids to descriptors and live connectors,
//!   creating connections lazily with single-flight deduplication.
//! - [`tools`] exposes declared server capabilities as named tools whose
//!   failures render as readable text results.
//!
//! Configuration loads from TOML via [`config`]; everything is constructed
//! explicitly (registry in, connectors out), so embedding applications own
//! the wiring and shutdown order.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod tools;
pub mod transport;

pub use config::{Capability, McpServerConfig, McpSettings};
pub use connection::{ConnectionState, ConnectionTuning, McpConnection};
pub use connector::McpConnector;
pub use error::McpError;
pub use events::McpServerRequest;
pub use registry::McpRegistry;
pub use tools::{all_tools, tools_for_server, McpTool};
pub use transport::McpTransportKind;
