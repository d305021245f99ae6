//! Server descriptors and settings data structures.
//!
//! A descriptor is static configuration for one external tool server. It is
//! immutable once a connection is live; reconfiguring a server means
//! disconnecting it and registering a fresh descriptor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named, described operation a tool server advertises. Each capability
/// becomes one agent-invocable tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Static configuration for one external MCP tool server.
///
/// `transport` selects the backend (`"stdio"` or one of the streamable-HTTP
/// spellings, defaulting to streamable HTTP). Stdio servers require
/// `command`; HTTP servers require `base_url`. Validation happens when a
/// connector is built, not at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Settings file root: the list of configured MCP servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpSettings {
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}
