//! Explicit channel payloads for server-initiated traffic.
//!
//! Connections forward server-to-client requests over an
//! `mpsc::UnboundedSender<McpServerRequest>` supplied at construction, so the
//! host application decides how (and whether) to answer them.

use rust_mcp_schema::schema_utils::ServerJsonrpcRequest;

#[derive(Debug, Clone)]
pub struct McpServerRequest {
    pub server_id: String,
    pub request: ServerJsonrpcRequest,
}
