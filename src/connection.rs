//! Connection state machine for one MCP server.
//!
//! A connection owns exactly one live (or attempting) transport, correlates
//! requests with responses through a pending table, enforces connect and
//! call timeouts, and reschedules itself with exponential backoff after a
//! transport crash. Concurrent `connect()` callers share a single in-flight
//! attempt; requests are rejected, never queued, while not connected.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use rust_mcp_schema::schema_utils::{
    NotificationFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::{InitializeResult, RequestId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::events::McpServerRequest;
use crate::protocol;
use crate::transport::{self, Transport, TransportEvent};

const RECONNECT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Timeouts and retry policy for one connection. Defaults are production
/// values; tests shrink them.
#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), McpError>>>;
type PendingSender = oneshot::Sender<Result<ServerMessage, McpError>>;

/// Lifecycle fields guarded together so state transitions stay serialized.
/// The guard is never held across an await point.
struct Lifecycle {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    connect_flight: Option<ConnectFuture>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    server_details: Option<InitializeResult>,
    /// Bumped on every transport build and on explicit disconnect; events
    /// carrying a stale epoch are ignored.
    epoch: u64,
}

struct ConnectionShared {
    config: McpServerConfig,
    tuning: ConnectionTuning,
    lifecycle: StdMutex<Lifecycle>,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    next_request_id: AtomicI64,
    server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
}

#[derive(Clone)]
pub struct McpConnection {
    shared: Arc<ConnectionShared>,
}

impl McpConnection {
    pub fn new(
        config: McpServerConfig,
        tuning: ConnectionTuning,
        server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                config,
                tuning,
                lifecycle: StdMutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    transport: None,
                    connect_flight: None,
                    reconnect_attempts: 0,
                    last_error: None,
                    server_details: None,
                    epoch: 0,
                }),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicI64::new(0),
                server_request_tx,
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn server_id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.lifecycle().last_error.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lifecycle().reconnect_attempts
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        self.lifecycle().server_details.clone()
    }

    /// Connects, sharing any in-flight attempt with concurrent callers.
    /// A no-op while already connected.
    pub async fn connect(&self) -> Result<(), McpError> {
        let flight = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == ConnectionState::Connected {
                return Ok(());
            }
            if let Some(flight) = lifecycle.connect_flight.clone() {
                flight
            } else {
                lifecycle.state = ConnectionState::Connecting;
                lifecycle.epoch += 1;
                let epoch = lifecycle.epoch;
                let this = self.clone();
                let flight: ConnectFuture =
                    async move { this.establish(epoch).await }.boxed().shared();
                lifecycle.connect_flight = Some(flight.clone());
                flight
            }
        };
        flight.await
    }

    async fn establish(&self, epoch: u64) -> Result<(), McpError> {
        let result = self.try_establish(epoch).await;
        if let Err(err) = &result {
            warn!(
                server_id = %self.server_id(),
                error = %err,
                "MCP connect attempt failed"
            );
            self.enter_error(epoch, err.to_string());
        }
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch == epoch {
                lifecycle.connect_flight = None;
            }
        }
        result
    }

    async fn try_establish(&self, epoch: u64) -> Result<(), McpError> {
        let (transport, events) = transport::open(&self.shared.config).await?;

        let stale = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch != epoch {
                true
            } else {
                lifecycle.transport = Some(transport.clone());
                false
            }
        };
        if stale {
            let _ = transport.close().await;
            return Err(McpError::ConnectionClosed);
        }

        let pump = self.clone();
        tokio::spawn(async move { pump.run_pump(events, epoch).await });

        let details = match self.handshake(&transport).await {
            Ok(details) => details,
            Err(err) => {
                let _ = transport.close().await;
                return Err(err);
            }
        };

        let stale = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch != epoch || lifecycle.transport.is_none() {
                true
            } else {
                lifecycle.state = ConnectionState::Connected;
                lifecycle.reconnect_attempts = 0;
                lifecycle.last_error = None;
                lifecycle.server_details = Some(details);
                false
            }
        };
        if stale {
            let _ = transport.close().await;
            return Err(McpError::ConnectionClosed);
        }
        debug!(server_id = %self.server_id(), "MCP connection established");
        Ok(())
    }

    /// Initialize request plus the `initialized` notification, raced
    /// against the connect timeout.
    async fn handshake(&self, transport: &Arc<dyn Transport>) -> Result<InitializeResult, McpError> {
        let params = protocol::client_details(&self.shared.config);
        let response = self
            .send_correlated(
                transport,
                RequestFromClient::InitializeRequest(params),
                self.shared.tuning.connect_timeout,
            )
            .await
            .map_err(|err| match err {
                McpError::CallTimeout(_) => McpError::ConnectTimeout,
                other => other,
            })?;
        let details = protocol::parse_initialize_result(response)?;
        transport.note_protocol_version(&details.protocol_version);

        let payload =
            protocol::encode_notification(NotificationFromClient::InitializedNotification(None))?;
        transport.send(payload).await?;
        Ok(details)
    }

    fn next_request_id(&self) -> (RequestId, i64) {
        let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        (RequestId::Integer(id), id)
    }

    /// Sends a typed request on the current transport. Fails immediately
    /// when the connection is not `Connected`; requests are never queued.
    pub async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, McpError> {
        let transport = self.connected_transport()?;
        self.send_correlated(&transport, request, self.shared.tuning.call_timeout)
            .await
    }

    /// Generic escape hatch: sends `method` with raw params and returns the
    /// response result value.
    pub async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let transport = self.connected_transport()?;
        let (request_id, id) = self.next_request_id();
        let payload = protocol::encode_raw_request(method, params, id);
        let response = self
            .dispatch_payload(
                &transport,
                payload,
                request_id,
                method,
                self.shared.tuning.call_timeout,
            )
            .await?;
        protocol::parse_response_value(response)
    }

    fn connected_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let lifecycle = self.lifecycle();
        if lifecycle.state != ConnectionState::Connected {
            return Err(McpError::NotConnected(lifecycle.state));
        }
        lifecycle
            .transport
            .clone()
            .ok_or(McpError::NotConnected(lifecycle.state))
    }

    async fn send_correlated(
        &self,
        transport: &Arc<dyn Transport>,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        let (request_id, _) = self.next_request_id();
        let (payload, method) = protocol::encode_request(request, request_id.clone())?;
        self.dispatch_payload(transport, payload, request_id, &method, timeout)
            .await
    }

    async fn dispatch_payload(
        &self,
        transport: &Arc<dyn Transport>,
        payload: String,
        request_id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        debug!(
            server_id = %self.server_id(),
            request_id = ?request_id,
            method = %method,
            "Sending MCP request"
        );
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        if let Err(err) = transport.send(payload).await {
            self.shared.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionLost(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                self.shared.pending.lock().await.remove(&request_id);
                debug!(
                    server_id = %self.server_id(),
                    request_id = ?request_id,
                    method = %method,
                    "MCP request timed out"
                );
                Err(McpError::CallTimeout(method.to_string()))
            }
        }
    }

    async fn run_pump(self, mut events: mpsc::UnboundedReceiver<TransportEvent>, epoch: u64) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => self.dispatch_message(message).await,
                TransportEvent::Closed(reason) => {
                    self.handle_transport_closed(epoch, reason).await;
                    return;
                }
            }
        }
        // Channel drained without a close event: the transport was shut
        // down explicitly and the connection already moved on.
    }

    async fn dispatch_message(&self, message: ServerMessage) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(
                    server_id = %self.server_id(),
                    response_id = ?response.id,
                    "Received MCP response"
                );
                let sender = self.shared.pending.lock().await.remove(&response.id);
                if let Some(tx) = sender {
                    let _ = tx.send(Ok(message));
                }
            }
            ServerMessage::Error(err) => {
                debug!(
                    server_id = %self.server_id(),
                    error_id = ?err.id,
                    error_code = err.error.code,
                    "Received MCP error"
                );
                if let Some(id) = err.id.as_ref() {
                    let sender = self.shared.pending.lock().await.remove(id);
                    if let Some(tx) = sender {
                        let _ = tx.send(Ok(message));
                    }
                }
            }
            ServerMessage::Request(request) => {
                debug!(
                    server_id = %self.server_id(),
                    method = %request.method(),
                    "Received MCP server request"
                );
                if let Some(tx) = &self.shared.server_request_tx {
                    let _ = tx.send(McpServerRequest {
                        server_id: self.server_id().to_string(),
                        request: request.clone(),
                    });
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server_id = %self.server_id(), "Received MCP notification");
            }
        }
    }

    async fn handle_transport_closed(&self, epoch: u64, reason: String) {
        let should_recover = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch != epoch
                || matches!(
                    lifecycle.state,
                    ConnectionState::Disconnected | ConnectionState::Error
                )
            {
                false
            } else {
                lifecycle.state = ConnectionState::Error;
                lifecycle.last_error = Some(reason.clone());
                lifecycle.transport = None;
                true
            }
        };
        if !should_recover {
            return;
        }

        warn!(server_id = %self.server_id(), reason = %reason, "MCP transport lost");
        self.reject_all_pending(McpError::ConnectionLost(reason)).await;
        self.schedule_reconnect();
    }

    /// Marks the connection failed and schedules recovery. Entering the
    /// error state is what triggers the reconnect, so a crash landing
    /// during a reconnect attempt cannot stall the cycle; the guards keep
    /// a transition that already ran from scheduling twice.
    fn enter_error(&self, epoch: u64, message: String) {
        let should_schedule = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch != epoch
                || matches!(
                    lifecycle.state,
                    ConnectionState::Disconnected | ConnectionState::Error
                )
            {
                false
            } else {
                lifecycle.state = ConnectionState::Error;
                lifecycle.last_error = Some(message);
                lifecycle.transport = None;
                true
            }
        };
        if should_schedule {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let (attempt, epoch) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ConnectionState::Error {
                return;
            }
            lifecycle.reconnect_attempts += 1;
            (lifecycle.reconnect_attempts, lifecycle.epoch)
        };

        let max_attempts = self.shared.tuning.max_reconnect_attempts;
        if attempt > max_attempts {
            error!(
                server_id = %self.server_id(),
                attempts = max_attempts,
                "Giving up on MCP reconnection"
            );
            return;
        }

        let delay = self
            .shared
            .tuning
            .reconnect_base_delay
            .mul_f64(RECONNECT_BACKOFF_MULTIPLIER.powi(attempt as i32 - 1));
        debug!(
            server_id = %self.server_id(),
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling MCP reconnect"
        );

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let lifecycle = this.lifecycle();
                if lifecycle.state != ConnectionState::Error || lifecycle.epoch != epoch {
                    return;
                }
            }
            if let Err(err) = this.connect().await {
                debug!(
                    server_id = %this.server_id(),
                    attempt = attempt,
                    error = %err,
                    "MCP reconnect attempt failed"
                );
            }
        });
    }

    /// Gracefully closes the transport, then unconditionally resets to
    /// `Disconnected`. Pending requests are rejected; idempotent.
    pub async fn disconnect(&self) {
        let transport = {
            let mut lifecycle = self.lifecycle();
            lifecycle.epoch += 1;
            lifecycle.state = ConnectionState::Disconnected;
            lifecycle.connect_flight = None;
            lifecycle.reconnect_attempts = 0;
            lifecycle.last_error = None;
            lifecycle.server_details = None;
            lifecycle.transport.take()
        };

        if let Some(transport) = transport {
            if let Err(err) = transport.close().await {
                warn!(
                    server_id = %self.server_id(),
                    error = %err,
                    "MCP transport close failed"
                );
            }
        }

        self.reject_all_pending(McpError::ConnectionClosed).await;
        debug!(server_id = %self.server_id(), "MCP connection disconnected");
    }

    async fn reject_all_pending(&self, err: McpError) {
        let senders: Vec<PendingSender> = {
            let mut pending = self.shared.pending.lock().await;
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Instant;

    /// Replies to every request with an id-matched response: a handshake
    /// result for `initialize`, a canned tool result for `tools/call`, and
    /// `{"ok":true}` otherwise.
    const RESPONDER_SCRIPT: &str = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-11-25","capabilities":{},"serverInfo":{"name":"mock","version":"0.1.0","icons":[]}}}\n' "$id" ;;
    *'"method":"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

    /// Handshakes, then swallows every further request without answering.
    const SILENT_AFTER_INIT_SCRIPT: &str = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-11-25","capabilities":{},"serverInfo":{"name":"mock","version":"0.1.0","icons":[]}}}\n' "$id" ;;
    *) : ;;
  esac
done
"#;

    /// Handshakes, then exits as soon as a real request arrives.
    const CRASH_ON_REQUEST_SCRIPT: &str = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-11-25","capabilities":{},"serverInfo":{"name":"mock","version":"0.1.0","icons":[]}}}\n' "$id" ;;
    *) exit 0 ;;
  esac
done
"#;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn stdio_config(script: &str) -> McpServerConfig {
        McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: Some("stdio".to_string()),
            command: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), script.to_string()]),
            env: None,
            base_url: None,
            protocol_version: None,
            enabled: Some(true),
            capabilities: Vec::new(),
        }
    }

    fn fast_tuning() -> ConnectionTuning {
        ConnectionTuning {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(50),
            max_reconnect_attempts: 5,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn connect_establishes_and_is_idempotent() {
        init_test_tracing();
        let connection =
            McpConnection::new(stdio_config(RESPONDER_SCRIPT), fast_tuning(), None);

        connection.connect().await.expect("connect should succeed");
        assert!(connection.is_connected());
        assert_eq!(
            connection
                .server_details()
                .map(|details| details.protocol_version),
            Some("2025-11-25".to_string())
        );

        connection.connect().await.expect("second connect is a no-op");
        assert!(connection.is_connected());

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_runs_on_a_spawned_task() {
        init_test_tracing();
        let connection =
            McpConnection::new(stdio_config(RESPONDER_SCRIPT), fast_tuning(), None);

        let handle = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect().await })
        };
        handle
            .await
            .expect("connect task should not panic")
            .expect("connect should succeed");
        assert!(connection.is_connected());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn requests_are_rejected_while_disconnected() {
        let connection =
            McpConnection::new(stdio_config(RESPONDER_SCRIPT), fast_tuning(), None);
        let err = connection
            .request_raw("status/ping", None)
            .await
            .expect_err("expected not-connected error");
        assert_eq!(err, McpError::NotConnected(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn raw_request_round_trips_a_value() {
        let connection =
            McpConnection::new(stdio_config(RESPONDER_SCRIPT), fast_tuning(), None);
        connection.connect().await.expect("connect should succeed");

        let value = connection
            .request_raw("status/ping", Some(serde_json::json!({"seq": 1})))
            .await
            .expect("request should succeed");
        assert_eq!(value.get("ok").and_then(Value::as_bool), Some(true));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn call_timeout_leaves_connection_usable() {
        let mut tuning = fast_tuning();
        tuning.call_timeout = Duration::from_millis(200);
        let connection =
            McpConnection::new(stdio_config(SILENT_AFTER_INIT_SCRIPT), tuning, None);
        connection.connect().await.expect("connect should succeed");

        let err = connection
            .request_raw("status/ping", None)
            .await
            .expect_err("expected timeout");
        assert!(matches!(err, McpError::CallTimeout(_)));
        assert!(connection.is_connected());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let connection =
            McpConnection::new(stdio_config(RESPONDER_SCRIPT), fast_tuning(), None);
        connection.connect().await.expect("connect should succeed");

        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let err = connection
            .request_raw("status/ping", None)
            .await
            .expect_err("expected not-connected error");
        assert!(matches!(err, McpError::NotConnected(_)));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_to_the_caller() {
        let mut config = stdio_config(RESPONDER_SCRIPT);
        config.command = Some("/definitely-missing-command".to_string());
        let connection = McpConnection::new(config, fast_tuning(), None);

        let err = connection.connect().await.expect_err("expected spawn failure");
        assert!(matches!(err, McpError::ConnectFailed(_)));
        assert_eq!(connection.state(), ConnectionState::Error);
        assert!(connection.last_error().is_some());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn transport_crash_rejects_pending_and_reconnects() {
        init_test_tracing();
        let connection = McpConnection::new(
            stdio_config(CRASH_ON_REQUEST_SCRIPT),
            fast_tuning(),
            None,
        );
        connection.connect().await.expect("connect should succeed");

        let err = connection
            .request_raw("status/ping", None)
            .await
            .expect_err("expected connection loss");
        assert!(matches!(
            err,
            McpError::ConnectionLost(_) | McpError::ConnectionClosed
        ));

        let recovered = wait_until(
            || connection.is_connected() && connection.reconnect_attempts() == 0,
            Duration::from_secs(5),
        )
        .await;
        assert!(recovered, "connection should re-establish after a crash");

        connection.disconnect().await;
    }

    async fn read_http_request(
        stream: &mut tokio::net::TcpStream,
    ) -> Result<(String, Vec<(String, String)>, Vec<u8>), String> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::new();
        let mut header_end = None;
        while header_end.is_none() {
            let mut chunk = [0_u8; 1024];
            let read = stream
                .read(&mut chunk)
                .await
                .map_err(|err| err.to_string())?;
            if read == 0 {
                return Err("Unexpected EOF while reading HTTP headers".to_string());
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = buffer
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|index| index + 4);
        }

        let header_end = header_end.expect("header end should exist");
        let header_text =
            std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
        let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
        let request_line = lines
            .next()
            .ok_or_else(|| "Missing HTTP request line".to_string())?
            .to_string();

        let mut headers = Vec::new();
        let mut content_length = 0_usize;
        for line in lines {
            let mut parts = line.splitn(2, ':');
            let Some(name) = parts.next() else {
                continue;
            };
            let value = parts.next().unwrap_or_default().trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
            }
            headers.push((name.to_string(), value));
        }

        let mut body = buffer[header_end..].to_vec();
        while body.len() < content_length {
            let mut chunk = vec![0_u8; content_length.saturating_sub(body.len())];
            let read = stream
                .read(&mut chunk)
                .await
                .map_err(|err| err.to_string())?;
            if read == 0 {
                return Err("Unexpected EOF while reading HTTP body".to_string());
            }
            body.extend_from_slice(&chunk[..read]);
        }
        body.truncate(content_length);

        Ok((request_line, headers, body))
    }

    type CapturedHttpRequests =
        Arc<Mutex<Vec<(String, String, String, Option<String>, Option<String>)>>>;

    #[tokio::test]
    async fn streamable_http_connection_handles_json_and_sse_responses() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        let captured_requests: CapturedHttpRequests = Arc::new(Mutex::new(Vec::new()));
        let captured_for_server = Arc::clone(&captured_requests);

        // Four POSTs (initialize, initialized, resources/list, tools/call)
        // plus the push-stream GET, which this server rejects.
        let server_task = tokio::spawn(async move {
            for _ in 0..5 {
                let (mut stream, _) =
                    listener.accept().await.map_err(|err| err.to_string())?;
                let (request_line, headers, body) = read_http_request(&mut stream).await?;
                let accept = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("accept"))
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let protocol_version = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("mcp-protocol-version"))
                    .map(|(_, value)| value.clone());
                let session_id = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("mcp-session-id"))
                    .map(|(_, value)| value.clone());

                if request_line.starts_with("GET") {
                    captured_for_server.lock().await.push((
                        request_line,
                        String::new(),
                        accept,
                        protocol_version,
                        session_id,
                    ));
                    stream
                        .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
                        .await
                        .map_err(|err| err.to_string())?;
                    continue;
                }

                let body_json: serde_json::Value =
                    serde_json::from_slice(&body).map_err(|err| err.to_string())?;
                let method = body_json
                    .get("method")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                let id = body_json.get("id").and_then(|value| value.as_i64());

                captured_for_server.lock().await.push((
                    request_line,
                    method.clone(),
                    accept,
                    protocol_version,
                    session_id,
                ));

                let response = if method == "initialize" {
                    let body = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2025-12-31",
                            "capabilities": {},
                            "serverInfo": {"name": "mock", "version": "0.1.0", "icons": []}
                        }
                    })
                    .to_string();
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nmcp-session-id: http-session\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(), body
                    )
                } else if method == "notifications/initialized" {
                    let body = "{}";
                    format!(
                        "HTTP/1.1 202 Accepted\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(), body
                    )
                } else if method == "resources/list" {
                    let event = format!(
                        "data: {{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":{{\"ok\":true}}}}\n\n",
                        id.unwrap_or_default()
                    );
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: Text/Event-Stream; Charset=UTF-8\r\ncontent-length: {}\r\n\r\n{}",
                        event.len(), event
                    )
                } else {
                    let body = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{"type": "text", "text": "pong"}],
                            "isError": false
                        }
                    })
                    .to_string();
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(), body
                    )
                };

                stream
                    .write_all(response.as_bytes())
                    .await
                    .map_err(|err| err.to_string())?;
            }
            Ok::<(), String>(())
        });

        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("http_proxy");
        std::env::remove_var("HTTPS_PROXY");
        std::env::remove_var("https_proxy");
        std::env::remove_var("ALL_PROXY");
        std::env::remove_var("all_proxy");
        std::env::set_var("NO_PROXY", "*");
        std::env::set_var("no_proxy", "*");

        let config = McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: Some("streamable-http".to_string()),
            command: None,
            args: None,
            env: None,
            base_url: Some(format!("http://{}", addr)),
            protocol_version: None,
            enabled: Some(true),
            capabilities: Vec::new(),
        };

        let connection = McpConnection::new(config, fast_tuning(), None);
        connection.connect().await.expect("connect should succeed");
        assert_eq!(
            connection
                .server_details()
                .map(|details| details.protocol_version),
            Some("2025-12-31".to_string())
        );

        let value = connection
            .request_raw("resources/list", None)
            .await
            .expect("SSE response should resolve");
        assert_eq!(value.get("ok").and_then(Value::as_bool), Some(true));

        let response = connection
            .send_request(RequestFromClient::CallToolRequest(
                rust_mcp_schema::CallToolRequestParams::new("lookup"),
            ))
            .await
            .expect("tool call should resolve");
        let result = protocol::parse_call_tool(response).expect("result should parse");
        assert_eq!(protocol::render_tool_result(&result), "pong");

        server_task
            .await
            .expect("mock server task should join")
            .expect("mock server should succeed");

        let captured = captured_requests.lock().await.clone();
        assert_eq!(captured.len(), 5);

        let posts: Vec<_> = captured
            .iter()
            .filter(|entry| entry.0.starts_with("POST"))
            .collect();
        let methods: Vec<&str> = posts.iter().map(|entry| entry.1.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "initialize",
                "notifications/initialized",
                "resources/list",
                "tools/call"
            ]
        );
        for post in &posts {
            assert_eq!(post.2, "application/json, text/event-stream");
        }
        assert_eq!(
            posts[0].3.as_deref(),
            Some(rust_mcp_schema::LATEST_PROTOCOL_VERSION)
        );
        assert_eq!(posts[1].3.as_deref(), Some("2025-12-31"));
        assert_eq!(posts[2].3.as_deref(), Some("2025-12-31"));
        assert_eq!(posts[0].4, None);
        assert_eq!(posts[2].4.as_deref(), Some("http-session"));

        let pushes: Vec<_> = captured
            .iter()
            .filter(|entry| entry.0.starts_with("GET"))
            .collect();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].4.as_deref(), Some("http-session"));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let marker_dir = tempfile::TempDir::new().expect("temp dir");
        let marker = marker_dir.path().join("starts");
        let script = format!(
            "echo started >> \"$MARKER_FILE\"\nsleep 1\n{}",
            RESPONDER_SCRIPT
        );

        let mut config = stdio_config(&script);
        let mut env = StdHashMap::new();
        env.insert(
            "MARKER_FILE".to_string(),
            marker.to_string_lossy().to_string(),
        );
        config.env = Some(env);

        let connection = McpConnection::new(config, fast_tuning(), None);
        let (first, second) = tokio::join!(connection.connect(), connection.connect());
        first.expect("first connect should succeed");
        second.expect("second connect should succeed");
        assert!(connection.is_connected());

        let starts = std::fs::read_to_string(&marker).expect("marker file should exist");
        assert_eq!(starts.lines().count(), 1, "exactly one child should spawn");

        connection.disconnect().await;
    }
}
