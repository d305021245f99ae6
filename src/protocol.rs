//! JSON-RPC envelope helpers over the `rust-mcp-schema` types.
//!
//! The wire format is owned by the MCP specification; this module only
//! builds outgoing envelopes and picks results and errors out of incoming
//! [`ServerMessage`]s.

use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolResult, ClientCapabilities, ClientSampling, Implementation, InitializeRequestParams,
    InitializeResult, RequestId, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::error::McpError;

pub(crate) fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

/// Client identity and capabilities advertised during the handshake.
pub(crate) fn client_details(config: &McpServerConfig) -> InitializeRequestParams {
    let capabilities = ClientCapabilities {
        sampling: Some(ClientSampling::default()),
        ..ClientCapabilities::default()
    };
    InitializeRequestParams {
        capabilities,
        client_info: Implementation {
            name: "mcp-switchboard".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("MCP Switchboard".to_string()),
            description: Some("MCP connection lifecycle runtime".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

/// Serializes a typed client request, returning the wire payload together
/// with the protocol method name for logging and timeout reporting.
pub(crate) fn encode_request(
    request: RequestFromClient,
    request_id: RequestId,
) -> Result<(String, String), McpError> {
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(request_id),
    )
    .map_err(|err| McpError::Protocol(err.to_string()))?;
    let value = serde_json::to_value(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
    let method = value
        .get("method")
        .and_then(|method| method.as_str())
        .unwrap_or("unknown")
        .to_string();
    Ok((value.to_string(), method))
}

pub(crate) fn encode_notification(
    notification: NotificationFromClient,
) -> Result<String, McpError> {
    let message = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(notification),
        None,
    )
    .map_err(|err| McpError::Protocol(err.to_string()))?;
    serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))
}

/// Builds a raw JSON-RPC request envelope for methods without a dedicated
/// typed wrapper. Correlation still rides the integer request id.
pub(crate) fn encode_raw_request(method: &str, params: Option<Value>, id: i64) -> String {
    let mut envelope = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        envelope["params"] = params;
    }
    envelope.to_string()
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| McpError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(rpc_error(&error.error)),
        other => Err(McpError::Protocol(format!("{other:?}"))),
    }
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, McpError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| McpError::Protocol(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Protocol(
            "initialize response carried a blank protocol version".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, McpError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<CallToolResult>(value)
        .map_err(|err| McpError::Protocol(err.to_string()))
}

/// Converts a JSON-RPC error object into [`McpError::Rpc`], folding any
/// server-provided detail blob into the message.
pub(crate) fn rpc_error(error: &RpcError) -> McpError {
    let mut message = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                message.push('\n');
                message.push_str(&details);
            }
        }
    }
    McpError::Rpc {
        code: error.code,
        message,
    }
}

/// Renders a tool result for the agent loop: the concatenated text content
/// blocks when present, otherwise the JSON serialization of the result.
pub fn render_tool_result(result: &CallToolResult) -> String {
    let value = match serde_json::to_value(result) {
        Ok(value) => value,
        Err(err) => return format!("Tool result could not be serialized: {err}"),
    };

    let texts: Vec<&str> = value
        .get("content")
        .and_then(|content| content.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(|text| text.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        value.to_string()
    } else {
        texts.join("\n")
    }
}
