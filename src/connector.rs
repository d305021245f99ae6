//! Uniform call surface over a connection, independent of transport kind.
//!
//! The connector validates transport parameters up front, so a broken
//! descriptor fails at build time instead of on first use, and exposes the
//! tool-call and generic request operations callers actually use.

use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::{CallToolRequestParams, CallToolResult, InitializeResult};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::McpServerConfig;
use crate::connection::{ConnectionState, ConnectionTuning, McpConnection};
use crate::error::McpError;
use crate::events::McpServerRequest;
use crate::protocol;
use crate::transport::{self, McpTransportKind};

#[derive(Clone)]
pub struct McpConnector {
    connection: McpConnection,
}

impl std::fmt::Debug for McpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnector")
            .field("server_id", &self.server_id())
            .field("state", &self.state())
            .finish()
    }
}

impl McpConnector {
    /// Builds a connector after validating the descriptor: the transport
    /// kind must be recognized and its required parameters present.
    pub fn build(
        config: McpServerConfig,
        tuning: ConnectionTuning,
        server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
    ) -> Result<Self, McpError> {
        match McpTransportKind::from_config(&config)? {
            McpTransportKind::Stdio => {
                transport::require_stdio_command(&config)?;
            }
            McpTransportKind::StreamableHttp => {
                transport::require_http_base_url(&config)?;
            }
        }
        Ok(Self {
            connection: McpConnection::new(config, tuning, server_request_tx),
        })
    }

    pub fn server_id(&self) -> &str {
        self.connection.server_id()
    }

    pub fn config(&self) -> &McpServerConfig {
        self.connection.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        self.connection.server_details()
    }

    pub async fn connect(&self) -> Result<(), McpError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    /// Invokes a tool by its bare capability name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        debug!(
            server_id = %self.server_id(),
            tool = %name,
            "Calling MCP tool"
        );
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .connection
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        protocol::parse_call_tool(response)
    }

    /// Sends an arbitrary request and returns the raw result value. Useful
    /// for methods the typed surface does not cover.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        self.connection.request_raw(method, params).await
    }
}
