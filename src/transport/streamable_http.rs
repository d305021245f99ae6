//! Streamed-HTTP transport.
//!
//! Client-to-server calls ride POST requests against the configured URL;
//! responses arrive either as direct JSON bodies or as short server-sent
//! event streams. Once the server has issued a session id, a persistent GET
//! event stream is attached for server-initiated pushes. Servers that reject
//! the GET stream are tolerated; an established push stream failing
//! mid-flight counts as a transport crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::transport::{Transport, TransportEvent};

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn require_http_base_url(config: &McpServerConfig) -> Result<String, McpError> {
    config.base_url.clone().ok_or_else(|| {
        McpError::Config("MCP base_url is required for HTTP transports.".to_string())
    })
}

fn build_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .timeout(std::time::Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(std::time::Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::ConnectFailed(format!("Failed to build HTTP client: {err}")))
}

/// Incremental decoder for newline-delimited SSE frames arriving in
/// arbitrary chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

fn decode_sse_line(line: &str) -> Option<ServerMessage> {
    let payload = sse_data_payload(line)?;
    if payload.is_empty() {
        return None;
    }
    serde_json::from_str::<ServerMessage>(payload).ok()
}

pub struct StreamableHttpTransport {
    client: reqwest::Client,
    base_url: String,
    server_id: String,
    requested_protocol_version: String,
    negotiated_protocol_version: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    listener_started: AtomicBool,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    /// Validates the descriptor and builds the HTTP client. The session
    /// itself is established by the first handshake POST; the push stream
    /// attaches once a session id exists.
    pub fn open(
        config: &McpServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        let base_url = require_http_base_url(config)?;
        let client = build_http_client()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                client,
                base_url,
                server_id: config.id.clone(),
                requested_protocol_version: crate::protocol::requested_protocol_version(config),
                negotiated_protocol_version: Mutex::new(None),
                session_id: Mutex::new(None),
                events: events_tx,
                listener_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            },
            events_rx,
        ))
    }

    fn protocol_version_header(&self) -> String {
        self.negotiated_protocol_version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.requested_protocol_version.clone())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record_session_id(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some(session_id.to_string());
        }
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT);
        let version = self.protocol_version_header();
        if !version.trim().is_empty() {
            request = request.header(MCP_PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    /// Attaches the persistent GET event stream once the server has issued
    /// a session id. Started at most once per transport.
    fn maybe_start_listener(&self) {
        if self.session_id().is_none() {
            return;
        }
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let server_id = self.server_id.clone();
        let session_id = self.session_id();
        let protocol_version = self.protocol_version_header();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut request = client
                .get(&base_url)
                .header("Accept", "text/event-stream");
            if !protocol_version.trim().is_empty() {
                request = request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version);
            }
            if let Some(session_id) = session_id {
                request = request.header(MCP_SESSION_ID_HEADER, session_id);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(_) => return,
            };
            if !response.status().is_success() {
                debug!(server_id = %server_id, status = %response.status(), "MCP push stream rejected");
                return;
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if !is_event_stream_content_type(content_type) {
                return;
            }

            let mut stream = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => return,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        let _ = events.send(TransportEvent::Closed(format!(
                            "MCP push stream failed: {err}"
                        )));
                        return;
                    }
                    // Graceful end; servers may close idle push streams.
                    None => return,
                };
                for line in buffer.push(&chunk) {
                    if let Some(message) = decode_sse_line(&line) {
                        if matches!(
                            message,
                            ServerMessage::Request(_) | ServerMessage::Notification(_)
                        ) && events.send(TransportEvent::Message(message)).is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Forwards every message decoded from a POST response body (JSON or
    /// SSE) onto the event channel; correlation happens in the connection.
    async fn forward_response_body(&self, response: reqwest::Response) -> Result<(), McpError> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let events = self.events.clone();
            let server_id = self.server_id.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut buffer = SseLineBuffer::default();
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            debug!(server_id = %server_id, error = %err, "MCP response stream failed");
                            return;
                        }
                    };
                    for line in buffer.push(&chunk) {
                        if let Some(message) = decode_sse_line(&line) {
                            if events.send(TransportEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                    }
                }
                for line in buffer.finish() {
                    if let Some(message) = decode_sse_line(&line) {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                }
            });
            return Ok(());
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| McpError::Transport(err.to_string()))?;
        if body.is_empty() {
            return Ok(());
        }
        match serde_json::from_slice::<ServerMessage>(&body) {
            Ok(message) => {
                let _ = self.events.send(TransportEvent::Message(message));
            }
            // Notification acks carry arbitrary bodies; anything that is
            // not a JSON-RPC envelope is not ours to route.
            Err(err) => {
                debug!(server_id = %self.server_id, error = %err, "Ignoring non-envelope MCP response body");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, payload: String) -> Result<(), McpError> {
        debug!(server_id = %self.server_id, url = %self.base_url, "Sending MCP HTTP request");
        let request = self.apply_headers(self.client.post(&self.base_url)).body(payload);
        let response = request
            .send()
            .await
            .map_err(|err| McpError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        self.record_session_id(&response);
        self.maybe_start_listener();
        self.forward_response_body(response).await
    }

    fn note_protocol_version(&self, version: &str) {
        if !version.trim().is_empty() {
            *self
                .negotiated_protocol_version
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(version.to_string());
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.cancel.cancel();
        Ok(())
    }
}
