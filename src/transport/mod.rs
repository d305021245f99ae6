//! Shared MCP transport abstractions.
//!
//! A transport is the raw bidirectional channel to one endpoint: it accepts
//! serialized JSON-RPC payloads, delivers decoded server messages on an
//! explicit event channel, and reports unexpected channel failure as a
//! [`TransportEvent::Closed`]. Retry policy lives in the owning connection;
//! `open` fails fast and `close` is idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ServerMessage;
use tokio::sync::mpsc;

use crate::config::McpServerConfig;
use crate::error::McpError;

pub mod stdio;
pub mod streamable_http;

pub use stdio::require_stdio_command;
pub use streamable_http::require_http_base_url;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" | "sse" => {
                Ok(McpTransportKind::StreamableHttp)
            }
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(McpError::Config(format!(
                "Unsupported MCP transport: {}",
                other
            ))),
        }
    }
}

/// Traffic the owning connection observes from a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded server message (response, error, request, or notification).
    Message(ServerMessage),
    /// The channel failed unexpectedly: process exit, socket reset.
    /// Not emitted for an explicit `close()`.
    Closed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one serialized JSON-RPC message to the endpoint.
    async fn send(&self, payload: String) -> Result<(), McpError>;

    /// Records the protocol version negotiated during the handshake so
    /// later traffic can advertise it. Default is a no-op; only the
    /// streamable-HTTP transport carries it as a header.
    fn note_protocol_version(&self, _version: &str) {}

    /// Releases the underlying process or sockets. Idempotent.
    async fn close(&self) -> Result<(), McpError>;
}

/// Builds the transport a descriptor calls for and hands back its event
/// channel. Fails fast on spawn/connect errors; retries are the
/// connection's responsibility.
pub async fn open(
    config: &McpServerConfig,
) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
    match McpTransportKind::from_config(config)? {
        McpTransportKind::Stdio => {
            let (transport, events) = stdio::StdioTransport::spawn(config)?;
            Ok((Arc::new(transport), events))
        }
        McpTransportKind::StreamableHttp => {
            let (transport, events) = streamable_http::StreamableHttpTransport::open(config)?;
            Ok((Arc::new(transport), events))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_transport(transport: Option<&str>) -> McpServerConfig {
        McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: transport.map(str::to_string),
            command: None,
            args: None,
            env: None,
            base_url: None,
            protocol_version: None,
            enabled: Some(true),
            capabilities: Vec::new(),
        }
    }

    #[test]
    fn transport_kind_resolves_known_spellings() {
        for spelling in ["streamable-http", "streamable_http", "http", "sse"] {
            assert_eq!(
                McpTransportKind::from_config(&config_with_transport(Some(spelling)))
                    .expect("kind should resolve"),
                McpTransportKind::StreamableHttp
            );
        }
        assert_eq!(
            McpTransportKind::from_config(&config_with_transport(Some("stdio")))
                .expect("kind should resolve"),
            McpTransportKind::Stdio
        );
    }

    #[test]
    fn transport_kind_defaults_to_streamable_http() {
        assert_eq!(
            McpTransportKind::from_config(&config_with_transport(None))
                .expect("kind should resolve"),
            McpTransportKind::StreamableHttp
        );
    }

    #[test]
    fn transport_kind_rejects_unknown_spelling() {
        let err = McpTransportKind::from_config(&config_with_transport(Some("carrier-pigeon")))
            .expect_err("expected config error");
        assert!(matches!(err, McpError::Config(_)));
    }
}
