//! Subprocess-pipe transport.
//!
//! Spawns the configured command and treats its stdin/stdout as the message
//! channel. Standard error is drained to diagnostic logging only, never as
//! protocol data. The child inherits the parent environment, merged with any
//! overrides from the descriptor.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ServerMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::transport::{Transport, TransportEvent};

const STDIN_LOCK_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(10);

pub fn require_stdio_command(config: &McpServerConfig) -> Result<String, McpError> {
    config.command.clone().ok_or_else(|| {
        McpError::Config("MCP command is required for stdio transport.".to_string())
    })
}

pub fn stdio_args(config: &McpServerConfig) -> Vec<String> {
    config.args.clone().unwrap_or_default()
}

pub fn stdio_env(config: &McpServerConfig) -> Option<HashMap<String, String>> {
    config.env.clone()
}

pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    cancel: CancellationToken,
    server_id: String,
}

impl StdioTransport {
    /// Spawns the configured child process and wires its pipes into the
    /// transport event channel. Spawn errors surface immediately.
    pub fn spawn(
        config: &McpServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        let command = require_stdio_command(config)?;
        let args = stdio_args(config);
        debug!(server_id = %config.id, command = %command, args = ?args, "Starting MCP stdio server");

        let mut cmd = Command::new(&command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = stdio_env(config) {
            cmd.envs(env);
        }

        let mut child = cmd.spawn().map_err(|err| {
            McpError::ConnectFailed(format!("failed to spawn '{}': {}", command, err))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ConnectFailed("Unable to retrieve stdin.".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ConnectFailed("Unable to retrieve stdout.".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::ConnectFailed("Unable to retrieve stderr.".to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        Self::spawn_stdout_reader(stdout, events_tx.clone(), config.id.clone());
        Self::spawn_stderr_drain(stderr, config.id.clone());
        Self::spawn_supervisor(child, events_tx, cancel.clone(), config.id.clone());

        Ok((
            Self {
                stdin: Mutex::new(stdin),
                cancel,
                server_id: config.id.clone(),
            },
            events_rx,
        ))
    }

    fn spawn_stdout_reader(
        stdout: tokio::process::ChildStdout,
        events: mpsc::UnboundedSender<TransportEvent>,
        server_id: String,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            if events.send(TransportEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    if events.send(TransportEvent::Message(message)).is_err() {
                        return;
                    }
                }
            }
            debug!(server_id = %server_id, "MCP stdio stdout closed");
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, server_id: String) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, "MCP stdio stderr: {}", line);
            }
        });
    }

    /// Waits on the child. An unexpected exit becomes a `Closed` event;
    /// cancellation (explicit close) kills the child silently.
    fn spawn_supervisor(
        mut child: tokio::process::Child,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
        server_id: String,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("MCP stdio process exited: {}", status),
                        Err(err) => format!("MCP stdio process wait failed: {}", err),
                    };
                    debug!(server_id = %server_id, "{}", reason);
                    let _ = events.send(TransportEvent::Closed(reason));
                }
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(server_id = %server_id, "MCP stdio process stopped");
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, payload: String) -> Result<(), McpError> {
        debug!(server_id = %self.server_id, bytes = payload.len(), "Writing MCP stdio message");
        let mut stdin = tokio::time::timeout(STDIN_LOCK_TIMEOUT, self.stdin.lock())
            .await
            .map_err(|_| {
                McpError::Transport("Timed out waiting for MCP stdio stdin lock.".to_string())
            })?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.write_all(payload.as_bytes()))
            .await
            .map_err(|_| McpError::Transport("Timed out writing MCP stdio message.".to_string()))?
            .map_err(|err| McpError::Transport(err.to_string()))?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.write_all(b"\n"))
            .await
            .map_err(|_| McpError::Transport("Timed out writing MCP stdio newline.".to_string()))?
            .map_err(|err| McpError::Transport(err.to_string()))?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.flush())
            .await
            .map_err(|_| McpError::Transport("Timed out flushing MCP stdio message.".to_string()))?
            .map_err(|err| McpError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(command: Option<&str>) -> McpServerConfig {
        McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: Some("stdio".to_string()),
            command: command.map(str::to_string),
            args: None,
            env: None,
            base_url: None,
            protocol_version: None,
            enabled: Some(true),
            capabilities: Vec::new(),
        }
    }

    #[test]
    fn missing_command_is_a_config_error() {
        let err = require_stdio_command(&stdio_config(None)).expect_err("expected config error");
        assert!(matches!(err, McpError::Config(_)));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_immediately() {
        let err = StdioTransport::spawn(&stdio_config(Some("/definitely-missing-command")))
            .map(|_| ())
            .expect_err("expected spawn failure");
        assert!(matches!(err, McpError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn process_exit_emits_closed_event() {
        let (transport, mut events) =
            StdioTransport::spawn(&stdio_config(Some("true"))).expect("spawn should succeed");

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive")
            .expect("channel should stay open");
        assert!(matches!(event, TransportEvent::Closed(_)));

        transport.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (transport, _events) =
            StdioTransport::spawn(&stdio_config(Some("cat"))).expect("spawn should succeed");
        transport.close().await.expect("first close");
        transport.close().await.expect("second close");
    }
}
