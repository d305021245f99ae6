//! Server registry: descriptors and live connectors.
//!
//! Descriptors are registered up front (usually from configuration); live
//! connectors are created lazily on first use. Concurrent first-use
//! requests for the same server share a single connect attempt, so one
//! slow server never spawns duplicate children or sessions.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::{McpServerConfig, McpSettings};
use crate::connection::ConnectionTuning;
use crate::connector::McpConnector;
use crate::error::McpError;
use crate::events::McpServerRequest;

type ConnectorFlight = Shared<BoxFuture<'static, Result<McpConnector, McpError>>>;

enum LiveEntry {
    Ready(McpConnector),
    Pending(ConnectorFlight),
}

pub struct McpRegistry {
    descriptors: Mutex<HashMap<String, McpServerConfig>>,
    live: Arc<Mutex<HashMap<String, LiveEntry>>>,
    tuning: ConnectionTuning,
    server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
}

impl McpRegistry {
    pub fn new(
        tuning: ConnectionTuning,
        server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
    ) -> Self {
        Self {
            descriptors: Mutex::new(HashMap::new()),
            live: Arc::new(Mutex::new(HashMap::new())),
            tuning,
            server_request_tx,
        }
    }

    /// Seeds the descriptor map from settings, skipping disabled servers.
    pub async fn from_settings(
        settings: &McpSettings,
        tuning: ConnectionTuning,
        server_request_tx: Option<mpsc::UnboundedSender<McpServerRequest>>,
    ) -> Self {
        let registry = Self::new(tuning, server_request_tx);
        for config in &settings.mcp_servers {
            if config.is_enabled() {
                registry.register_server(config.clone()).await;
            } else {
                debug!(server_id = %config.id, "Skipping disabled MCP server");
            }
        }
        registry
    }

    fn key(server_id: &str) -> String {
        server_id.to_lowercase()
    }

    /// Registers (or replaces) a descriptor. An existing live connector is
    /// left untouched; the new descriptor applies on the next connect.
    pub async fn register_server(&self, config: McpServerConfig) {
        let key = Self::key(&config.id);
        debug!(server_id = %config.id, "Registering MCP server");
        self.descriptors.lock().await.insert(key, config);
    }

    pub async fn server_config(&self, server_id: &str) -> Option<McpServerConfig> {
        self.descriptors
            .lock()
            .await
            .get(&Self::key(server_id))
            .cloned()
    }

    pub async fn registered_servers(&self) -> Vec<McpServerConfig> {
        let mut configs: Vec<McpServerConfig> =
            self.descriptors.lock().await.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let live = self.live.lock().await;
        let mut ids: Vec<String> = live
            .iter()
            .filter_map(|(key, entry)| match entry {
                LiveEntry::Ready(connector) if connector.is_connected() => {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Returns a connected connector for `server_id`, creating and
    /// connecting one if none exists. Concurrent callers share a single
    /// attempt; a failed attempt is evicted so the next call retries.
    pub async fn get_connector(&self, server_id: &str) -> Result<McpConnector, McpError> {
        let key = Self::key(server_id);

        let flight = {
            let mut live = self.live.lock().await;
            match live.get(&key) {
                Some(LiveEntry::Ready(connector)) => return Ok(connector.clone()),
                Some(LiveEntry::Pending(flight)) => flight.clone(),
                None => {
                    let config = match self.server_config(server_id).await {
                        Some(config) => config,
                        None => {
                            return Err(McpError::NotRegistered(server_id.to_string()))
                        }
                    };
                    let flight = self.spawn_connect_flight(key.clone(), config);
                    live.insert(key.clone(), LiveEntry::Pending(flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    fn spawn_connect_flight(&self, key: String, config: McpServerConfig) -> ConnectorFlight {
        let live = Arc::clone(&self.live);
        let tuning = self.tuning.clone();
        let server_request_tx = self.server_request_tx.clone();

        async move {
            let connector = match McpConnector::build(config, tuning, server_request_tx) {
                Ok(connector) => connector,
                Err(err) => {
                    live.lock().await.remove(&key);
                    return Err(err);
                }
            };

            match connector.connect().await {
                Ok(()) => {
                    let mut live = live.lock().await;
                    // A disconnect may have raced the flight; do not
                    // resurrect an evicted entry.
                    if matches!(live.get(&key), Some(LiveEntry::Pending(_))) {
                        live.insert(key, LiveEntry::Ready(connector.clone()));
                        Ok(connector)
                    } else {
                        drop(live);
                        connector.disconnect().await;
                        Err(McpError::ConnectionClosed)
                    }
                }
                Err(err) => {
                    live.lock().await.remove(&key);
                    // Stop the connector's own background retries; the
                    // next get_connector call starts fresh.
                    connector.disconnect().await;
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Disconnects and evicts the live connector for `server_id`, if any.
    /// The descriptor stays registered.
    pub async fn disconnect_server(&self, server_id: &str) {
        let key = Self::key(server_id);
        let entry = self.live.lock().await.remove(&key);
        match entry {
            Some(LiveEntry::Ready(connector)) => {
                connector.disconnect().await;
                debug!(server_id = %server_id, "Disconnected MCP server");
            }
            Some(LiveEntry::Pending(_)) => {
                // The flight notices the eviction when it completes.
                debug!(server_id = %server_id, "Evicted pending MCP connection");
            }
            None => {}
        }
    }

    /// Disconnects every live connector. One failure never stops the rest.
    pub async fn disconnect_all(&self) {
        let entries: Vec<(String, LiveEntry)> =
            self.live.lock().await.drain().collect();
        let shutdowns = entries.into_iter().filter_map(|(key, entry)| match entry {
            LiveEntry::Ready(connector) => Some(async move {
                connector.disconnect().await;
                debug!(server_id = %key, "Disconnected MCP server");
            }),
            LiveEntry::Pending(_) => {
                warn!(server_id = %key, "Dropping pending MCP connection on shutdown");
                None
            }
        });
        join_all(shutdowns).await;
    }
}
