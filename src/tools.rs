//! Tool facade over registered MCP servers.
//!
//! Each declared capability becomes one tool named
//! `{display_name}-{capability}`; invoking it lazily connects through the
//! registry and forwards the bare capability name to the server. Failures
//! come back as a readable string result, never as a panic or a dropped
//! call.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::McpServerConfig;
use crate::protocol::render_tool_result;
use crate::registry::McpRegistry;

const DEFAULT_CAPABILITY: &str = "default";

#[derive(Clone)]
pub struct McpTool {
    name: String,
    description: String,
    server_id: String,
    capability: String,
    registry: Arc<McpRegistry>,
}

impl McpTool {
    /// Exposed tool name, `{display_name}-{capability}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Bare capability name as the server knows it.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Runs the tool, connecting on demand. Any failure (unregistered
    /// server, connect error, timeout, server-side tool error) is
    /// rendered into the returned string so the caller always gets a
    /// result to show.
    pub async fn invoke(&self, arguments: Option<Map<String, Value>>) -> String {
        debug!(
            tool = %self.name,
            server_id = %self.server_id,
            capability = %self.capability,
            "Invoking MCP tool"
        );
        let connector = match self.registry.get_connector(&self.server_id).await {
            Ok(connector) => connector,
            Err(err) => return format!("Tool execution failed: {}", err),
        };
        match connector.call_tool(&self.capability, arguments).await {
            Ok(result) => render_tool_result(&result),
            Err(err) => format!("Tool execution failed: {}", err),
        }
    }
}

/// Builds the tool list for one server descriptor. A server with no
/// declared capabilities still gets a single catch-all tool so it remains
/// reachable.
pub fn tools_for_server(config: &McpServerConfig, registry: Arc<McpRegistry>) -> Vec<McpTool> {
    if config.capabilities.is_empty() {
        return vec![McpTool {
            name: format!("{}-{}", config.display_name, DEFAULT_CAPABILITY),
            description: format!("Invoke the {} MCP server", config.display_name),
            server_id: config.id.clone(),
            capability: DEFAULT_CAPABILITY.to_string(),
            registry,
        }];
    }

    config
        .capabilities
        .iter()
        .map(|capability| McpTool {
            name: format!("{}-{}", config.display_name, capability.name),
            description: if capability.description.is_empty() {
                format!(
                    "Invoke {} on the {} MCP server",
                    capability.name, config.display_name
                )
            } else {
                capability.description.clone()
            },
            server_id: config.id.clone(),
            capability: capability.name.clone(),
            registry: Arc::clone(&registry),
        })
        .collect()
}

/// Builds tools for every registered server, sorted by tool name.
pub async fn all_tools(registry: &Arc<McpRegistry>) -> Vec<McpTool> {
    let mut tools = Vec::new();
    for config in registry.registered_servers().await {
        tools.extend(tools_for_server(&config, Arc::clone(registry)));
    }
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    tools
}
