//! Crate-wide error type for MCP connection and call failures.
//!
//! Lower layers surface raw errors as strings; the connection attaches
//! classification before handing them to callers. Errors are `Clone` so a
//! connect outcome can flow through a shared single-flight future.

use std::fmt;

use crate::connection::ConnectionState;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpError {
    /// No descriptor registered under the given server id.
    NotRegistered(String),

    /// Missing or invalid transport parameters in a server descriptor.
    Config(String),

    /// The transport could not be established (spawn or handshake failure).
    ConnectFailed(String),

    /// The connect handshake did not complete within the connect timeout.
    ConnectTimeout,

    /// A request was issued while the connection was not in the
    /// `Connected` state; requests are never queued.
    NotConnected(ConnectionState),

    /// No response arrived for the named method within the call timeout.
    CallTimeout(String),

    /// The transport failed while requests were outstanding.
    ConnectionLost(String),

    /// The connection was explicitly disconnected.
    ConnectionClosed,

    /// The server answered with a JSON-RPC error.
    Rpc { code: i64, message: String },

    /// A raw channel failure: write error, HTTP failure, broken pipe.
    Transport(String),

    /// The peer sent something that does not fit the MCP envelope.
    Protocol(String),
}

impl McpError {
    /// True when a server reports the JSON-RPC method-not-found code, which
    /// callers treat as a soft "no such capability" signal.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, McpError::Rpc { code, .. } if *code == MCP_METHOD_NOT_FOUND)
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::NotRegistered(id) => {
                write!(f, "MCP server '{}' is not registered", id)
            }
            McpError::Config(message) => write!(f, "{}", message),
            McpError::ConnectFailed(message) => {
                write!(f, "MCP connect failed: {}", message)
            }
            McpError::ConnectTimeout => write!(f, "MCP connect timed out"),
            McpError::NotConnected(state) => {
                write!(f, "MCP connection is not connected (state: {})", state)
            }
            McpError::CallTimeout(method) => {
                write!(f, "MCP request '{}' timed out", method)
            }
            McpError::ConnectionLost(reason) => {
                write!(f, "MCP connection lost: {}", reason)
            }
            McpError::ConnectionClosed => write!(f, "MCP connection closed"),
            McpError::Rpc { code, message } => {
                write!(f, "MCP error {}: {}", code, message)
            }
            McpError::Transport(message) => write!(f, "{}", message),
            McpError::Protocol(message) => {
                write!(f, "Unexpected MCP message: {}", message)
            }
        }
    }
}

impl std::error::Error for McpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_is_detected_by_code() {
        let err = McpError::Rpc {
            code: MCP_METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
        };
        assert!(err.is_method_not_found());

        let err = McpError::Rpc {
            code: -32600,
            message: "Invalid request".to_string(),
        };
        assert!(!err.is_method_not_found());
    }

    #[test]
    fn display_includes_connection_state() {
        let err = McpError::NotConnected(ConnectionState::Disconnected);
        assert!(err.to_string().contains("disconnected"));
    }
}
