// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client manager: one session slot per server name.
//!
//! The slot map is behind a synchronous lock that is never held across an
//! `.await`. A connect reserves its slot under the lock and runs the
//! handshake outside it, so servers connect independently and a second
//! connect to the same server is rejected while the first is in flight.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{McpClient, NotificationSink};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::ServerInfo;
use crate::session::{Capabilities, SessionState};
use crate::transport::{self, Connection};

/// Connection status of a server, as reported by [`ClientManager::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub status: ServerStatus,
    pub state: Option<SessionState>,
    pub capabilities: Capabilities,
    pub server_info: Option<ServerInfo>,
    pub outstanding: usize,
    pub last_error: Option<String>,
}

enum Slot {
    Connecting,
    Ready(Arc<McpClient>),
    Failed {
        client: Option<Arc<McpClient>>,
        error: String,
    },
    Disconnected(Arc<McpClient>),
}

impl Slot {
    fn client(&self) -> Option<&Arc<McpClient>> {
        match self {
            Self::Ready(client) | Self::Disconnected(client) => Some(client),
            Self::Failed { client, .. } => client.as_ref(),
            Self::Connecting => None,
        }
    }

    fn status(&self) -> ServerStatus {
        match self {
            Self::Connecting => ServerStatus::Connecting,
            Self::Ready(client) if client.is_lost() => ServerStatus::Error,
            Self::Ready(_) => ServerStatus::Connected,
            Self::Failed { .. } => ServerStatus::Error,
            Self::Disconnected(_) => ServerStatus::Disconnected,
        }
    }

    /// Whether a new connect must be refused.
    fn is_busy(&self) -> bool {
        match self {
            Self::Connecting => true,
            Self::Ready(client) => !client.is_lost(),
            _ => false,
        }
    }
}

/// Owns every server session.
pub struct ClientManager {
    slots: RwLock<HashMap<String, Slot>>,
    events: Arc<EventBus>,
    client_name: String,
    sink: Option<NotificationSink>,
}

impl ClientManager {
    /// Create a manager. `sink` receives every server notification.
    pub fn new(
        client_name: impl Into<String>,
        events: Arc<EventBus>,
        sink: Option<NotificationSink>,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            events,
            client_name: client_name.into(),
            sink,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Event bus lifecycle events are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn reserve(&self, name: &str) -> Result<()> {
        let mut slots = self.write();
        if slots.get(name).is_some_and(Slot::is_busy) {
            return Err(BridgeError::AlreadyConnected(name.to_string()));
        }
        slots.insert(name.to_string(), Slot::Connecting);
        Ok(())
    }

    fn fail(&self, name: &str, client: Option<Arc<McpClient>>, error: &BridgeError) {
        self.write().insert(
            name.to_string(),
            Slot::Failed {
                client,
                error: error.to_string(),
            },
        );
        warn!(server = name, error = %error, "MCP server connection failed");
        self.events.emit(BridgeEvent::ServerError {
            server: name.to_string(),
            error: error.to_string(),
        });
    }

    /// Open the configured transport and run the handshake.
    pub async fn connect(&self, config: ServerConfig) -> Result<Arc<McpClient>> {
        self.reserve(&config.name)?;
        self.events.emit(BridgeEvent::ServerConnecting {
            server: config.name.clone(),
        });

        let connection = match transport::open(&config).await {
            Ok(connection) => connection,
            Err(e) => {
                self.fail(&config.name, None, &e);
                return Err(e);
            }
        };

        self.handshake(config, connection).await
    }

    /// Run the handshake over a caller-supplied connection.
    pub async fn connect_with(
        &self,
        config: ServerConfig,
        connection: Connection,
    ) -> Result<Arc<McpClient>> {
        self.reserve(&config.name)?;
        self.events.emit(BridgeEvent::ServerConnecting {
            server: config.name.clone(),
        });
        self.handshake(config, connection).await
    }

    async fn handshake(
        &self,
        config: ServerConfig,
        connection: Connection,
    ) -> Result<Arc<McpClient>> {
        let name = config.name.clone();
        let timeout = config.connect_timeout();
        debug!(server = %name, transport = connection.transport.kind(), "Starting handshake");

        let client = Arc::new(McpClient::start(
            config,
            self.client_name.clone(),
            connection,
            Arc::clone(&self.events),
            self.sink.clone(),
        ));

        match client.initialize(timeout).await {
            Ok(_) => {
                let capabilities = client.capabilities();
                self.write().insert(name.clone(), Slot::Ready(Arc::clone(&client)));
                self.events.emit(BridgeEvent::ServerConnected {
                    server: name,
                    capabilities,
                });
                Ok(client)
            }
            Err(e) => {
                self.fail(&name, Some(client), &e);
                Err(e)
            }
        }
    }

    /// Connect every enabled server concurrently.
    ///
    /// One server failing does not affect the others; results come back
    /// sorted by server name.
    pub async fn connect_all(
        self: &Arc<Self>,
        configs: impl IntoIterator<Item = ServerConfig>,
    ) -> Vec<(String, Result<()>)> {
        let mut tasks = JoinSet::new();

        for config in configs.into_iter().filter(|c| c.enabled) {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                let name = config.name.clone();
                let result = manager.connect(config).await.map(|_| ());
                (name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => warn!(error = %e, "connect task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(connected, total = results.len(), "Connected MCP servers");
        results
    }

    /// Disconnect one server. The slot is kept, so later calls report
    /// `InvalidSessionState` rather than `ServerNotFound`.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let client = match self.read().get(name) {
            None => return Err(BridgeError::ServerNotFound(name.to_string())),
            Some(Slot::Connecting) => {
                return Err(BridgeError::InvalidSessionState {
                    server: name.to_string(),
                    state: SessionState::Initializing,
                })
            }
            Some(Slot::Ready(client)) => Arc::clone(client),
            Some(_) => return Ok(()),
        };

        client.disconnect().await;

        {
            let mut slots = self.write();
            if let Some(slot) = slots.get_mut(name) {
                if matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, &client)) {
                    *slot = Slot::Disconnected(Arc::clone(&client));
                }
            }
        }

        self.events.emit(BridgeEvent::ServerDisconnected {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Disconnect every connected server.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                debug!(server = %name, error = %e, "disconnect failed");
            }
        }
    }

    /// The client for `name`, in whatever state it is.
    pub fn client(&self, name: &str) -> Result<Arc<McpClient>> {
        let slots = self.read();
        let slot = slots
            .get(name)
            .ok_or_else(|| BridgeError::ServerNotFound(name.to_string()))?;

        match slot.client() {
            Some(client) => Ok(Arc::clone(client)),
            None => Err(BridgeError::InvalidSessionState {
                server: name.to_string(),
                state: match slot {
                    Slot::Connecting => SessionState::Initializing,
                    _ => SessionState::Shutdown,
                },
            }),
        }
    }

    /// Clients whose sessions are live.
    pub fn connected_clients(&self) -> Vec<Arc<McpClient>> {
        let mut clients: Vec<_> = self
            .read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(client) if !client.is_lost() => Some(Arc::clone(client)),
                _ => None,
            })
            .collect();
        clients.sort_by(|a, b| a.name().cmp(b.name()));
        clients
    }

    /// Connection status of one server.
    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.read().get(name).map(Slot::status)
    }

    /// Status of every known server, sorted by name.
    pub fn statuses(&self) -> Vec<(String, ServerStatus)> {
        let mut statuses: Vec<_> = self
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Detailed view of every known server, sorted by name.
    pub fn summaries(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<_> = self
            .read()
            .iter()
            .map(|(name, slot)| {
                let client = slot.client();
                let last_error = match slot {
                    Slot::Failed { error, .. } => Some(error.clone()),
                    _ => client.and_then(|c| c.last_error()),
                };
                ServerSummary {
                    name: name.clone(),
                    status: slot.status(),
                    state: client.map(|c| c.state()),
                    capabilities: client.map(|c| c.capabilities()).unwrap_or_default(),
                    server_info: client.and_then(|c| c.server_info()),
                    outstanding: client.map(|c| c.outstanding()).unwrap_or(0),
                    last_error,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Negotiated capabilities of one server.
    pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.read().get(name)?.client().map(|c| c.capabilities())
    }

    /// Server information reported during the handshake.
    pub fn server_info(&self, name: &str) -> Option<ServerInfo> {
        self.read().get(name)?.client()?.server_info()
    }

    /// Every known server name, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Capability;
    use crate::transport::memory::{handshake_result, pair, PeerReply};
    use serde_json::json;
    use std::time::Duration;

    fn manager() -> Arc<ClientManager> {
        Arc::new(ClientManager::new("test", Arc::new(EventBus::new()), None))
    }

    fn config(name: &str) -> ServerConfig {
        ServerConfig::stdio(name, "unused").with_connect_timeout(Duration::from_millis(200))
    }

    fn fake(name: &str, caps: Capabilities) -> Connection {
        let (conn, peer) = pair(name);
        let server = name.to_string();
        peer.serve(move |req| match req.method.as_str() {
            "initialize" => PeerReply::Result(handshake_result(&server, caps)),
            _ => PeerReply::Result(json!({})),
        });
        conn
    }

    #[tokio::test]
    async fn test_connect_and_status() {
        let manager = manager();
        let caps = Capabilities::default().with(Capability::Tools, true);

        manager.connect_with(config("alpha"), fake("alpha", caps)).await.unwrap();

        assert_eq!(manager.status("alpha"), Some(ServerStatus::Connected));
        assert_eq!(manager.capabilities("alpha"), Some(caps));
        assert_eq!(manager.server_info("alpha").unwrap().name, "alpha");
        assert_eq!(manager.server_names(), vec!["alpha"]);
        assert!(manager.status("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let manager = manager();
        manager
            .connect_with(config("alpha"), fake("alpha", Capabilities::all()))
            .await
            .unwrap();

        let err = manager
            .connect_with(config("alpha"), fake("alpha", Capabilities::all()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyConnected(_)));
        assert_eq!(manager.status("alpha"), Some(ServerStatus::Connected));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let manager = manager();
        manager
            .connect_with(config("alpha"), fake("alpha", Capabilities::all()))
            .await
            .unwrap();

        manager.disconnect("alpha").await.unwrap();
        assert_eq!(manager.status("alpha"), Some(ServerStatus::Disconnected));
        let client = manager.client("alpha").unwrap();
        assert_eq!(client.state(), SessionState::Shutdown);

        // Second disconnect is a no-op.
        manager.disconnect("alpha").await.unwrap();

        let fresh = manager
            .connect_with(config("alpha"), fake("alpha", Capabilities::all()))
            .await
            .unwrap();
        assert_eq!(fresh.next_request_id(), 2);
        assert_eq!(manager.status("alpha"), Some(ServerStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_marks_error() {
        let manager = manager();
        let (conn, _peer) = pair("slow");

        let err = manager.connect_with(config("slow"), conn).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionTimeout { .. }));
        assert_eq!(manager.status("slow"), Some(ServerStatus::Error));

        let summary = &manager.summaries()[0];
        assert!(summary.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let manager = manager();
        assert!(matches!(
            manager.disconnect("ghost").await,
            Err(BridgeError::ServerNotFound(_))
        ));
        assert!(matches!(manager.client("ghost"), Err(BridgeError::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn test_connect_all_partial_availability() {
        let manager = manager();
        let broken = ServerConfig::stdio("broken", "/nonexistent/mcp-server-binary");
        let mut disabled = config("off");
        disabled.enabled = false;

        // `good` has no real command, so it connects over memory first.
        manager
            .connect_with(config("good"), fake("good", Capabilities::all()))
            .await
            .unwrap();

        let results = manager.connect_all(vec![broken, disabled]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "broken");
        assert!(matches!(results[0].1, Err(BridgeError::ConnectionFailed { .. })));

        assert_eq!(manager.status("good"), Some(ServerStatus::Connected));
        assert_eq!(manager.status("broken"), Some(ServerStatus::Error));
        assert!(manager.status("off").is_none());
        assert_eq!(manager.connected_clients().len(), 1);
    }
}
