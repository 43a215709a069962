// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bridge facade.
//!
//! [`Bridge`] is the entry point applications use. It owns the client
//! manager, the shared resource cache, the event bus and the registry of
//! resource update callbacks. Every operation emits a requested event
//! followed by exactly one success or error event.
//!
//! ```rust,ignore
//! use mcp_bridge::{Bridge, BridgeConfig, ServerConfig};
//! use serde_json::json;
//!
//! let bridge = Bridge::new(&BridgeConfig::default());
//! bridge.connect(ServerConfig::stdio("fs", "mcp-server-fs")).await?;
//!
//! let result = bridge.call_tool("fs", "read_file", json!({"path": "README.md"})).await?;
//! println!("{}", result.as_text());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheStats, ResponseCache};
use crate::client::{CallOptions, McpClient, NotificationSink};
use crate::config::{BridgeConfig, ServerConfig};
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus, ListKind};
use crate::manager::{ClientManager, ServerStatus, ServerSummary};
use crate::protocol::{
    methods, split_qualified, GetPromptResult, JsonRpcNotification, PromptInfo,
    ReadResourceResult, ResourceInfo, ResourceUpdate, ServerInfo, ToolInfo, ToolResult,
};
use crate::session::{Capabilities, Capability, SessionState};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Callback invoked when a subscribed resource changes.
pub type UpdateCallback = Arc<dyn Fn(&ResourceUpdate) + Send + Sync>;

/// Handle for one local resource subscription. Pass it to
/// [`Bridge::unsubscribe`] to stop receiving updates.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceSubscription {
    id: u64,
    server: String,
    uri: String,
}

impl ResourceSubscription {
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

type SubscriptionKey = (String, String);

/// Update callbacks keyed by `(server, uri)`.
#[derive(Default)]
struct SubscriptionRegistry {
    callbacks: Mutex<HashMap<SubscriptionKey, Vec<(u64, UpdateCallback)>>>,
    /// Serializes the subscribe/unsubscribe round trips of one key.
    gates: Mutex<HashMap<SubscriptionKey, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Vec<(u64, UpdateCallback)>>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, server: &str, uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            gates
                .entry((server.to_string(), uri.to_string()))
                .or_default(),
        )
    }

    fn drop_gates(&self, server: Option<&str>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        match server {
            Some(server) => gates.retain(|(owner, _), _| owner != server),
            None => gates.clear(),
        }
    }

    /// Register a callback. Returns its id and whether it is the first for the key.
    fn add(&self, server: &str, uri: &str, callback: UpdateCallback) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut callbacks = self.lock();
        let entry = callbacks
            .entry((server.to_string(), uri.to_string()))
            .or_default();
        entry.push((id, callback));
        (id, entry.len() == 1)
    }

    /// Remove a callback. Returns `Some(was_last)` if it was registered.
    fn remove(&self, server: &str, uri: &str, id: u64) -> Option<bool> {
        let mut callbacks = self.lock();
        let key = (server.to_string(), uri.to_string());
        let entry = callbacks.get_mut(&key)?;
        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        if entry.len() == before {
            return None;
        }
        let last = entry.is_empty();
        if last {
            callbacks.remove(&key);
        }
        Some(last)
    }

    fn remove_server(&self, server: &str) -> usize {
        self.drop_gates(Some(server));
        let mut callbacks = self.lock();
        let before = callbacks.len();
        callbacks.retain(|(owner, _), _| owner != server);
        before - callbacks.len()
    }

    fn snapshot(&self, server: &str, uri: &str) -> Vec<UpdateCallback> {
        self.lock()
            .get(&(server.to_string(), uri.to_string()))
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn count(&self, server: &str, uri: &str) -> usize {
        self.lock()
            .get(&(server.to_string(), uri.to_string()))
            .map_or(0, Vec::len)
    }

    fn clear(&self) {
        self.drop_gates(None);
        self.lock().clear();
    }
}

/// Route server notifications: resource updates invalidate the cache, reach
/// every registered callback and then go out as `mcp:resource:updated`.
fn notification_router(
    cache: Arc<ResponseCache>,
    subscriptions: Arc<SubscriptionRegistry>,
    events: Arc<EventBus>,
) -> NotificationSink {
    Arc::new(move |server: &str, notification: &JsonRpcNotification| {
        match notification.method.as_str() {
            methods::RESOURCE_UPDATED => {
                let Some(uri) = notification.param_str("uri") else {
                    warn!(server, "resource update without uri");
                    return;
                };

                cache.invalidate(server, uri);

                let update = ResourceUpdate {
                    server: server.to_string(),
                    uri: uri.to_string(),
                };
                for callback in subscriptions.snapshot(server, uri) {
                    callback(&update);
                }

                events.emit(BridgeEvent::ResourceUpdated {
                    server: update.server,
                    uri: update.uri,
                });
            }
            methods::RESOURCE_LIST_CHANGED => {
                debug!(server, "resource list changed");
            }
            other => debug!(server, method = other, "Ignoring notification"),
        }
    })
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BridgeError::validation(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Arguments must be a JSON object; `null` means none.
fn object_arguments(arguments: Value) -> Result<Value> {
    match arguments {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(arguments),
        other => Err(BridgeError::validation(format!(
            "arguments must be a JSON object, got {}",
            other
        ))),
    }
}

/// Facade over every MCP server the application talks to.
pub struct Bridge {
    manager: Arc<ClientManager>,
    cache: Arc<ResponseCache>,
    events: Arc<EventBus>,
    subscriptions: Arc<SubscriptionRegistry>,
    servers: Vec<ServerConfig>,
}

impl Bridge {
    /// Create a bridge. Servers in `config` are remembered for
    /// [`Bridge::connect_configured`] but not connected yet.
    pub fn new(config: &BridgeConfig) -> Self {
        let cache = Arc::new(ResponseCache::with_budget(config.cache.clone()));
        let events = Arc::new(EventBus::new());
        let subscriptions = Arc::new(SubscriptionRegistry::default());

        let sink = notification_router(
            Arc::clone(&cache),
            Arc::clone(&subscriptions),
            Arc::clone(&events),
        );
        let manager = Arc::new(ClientManager::new(
            config.client_name.clone(),
            Arc::clone(&events),
            Some(sink),
        ));

        Self {
            manager,
            cache,
            events,
            subscriptions,
            servers: config.enabled_servers().into_iter().cloned().collect(),
        }
    }

    /// Event bus every bridge event is published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Shared resource cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Underlying client manager.
    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reset the server's cache slot once a connect attempt has claimed it.
    /// A refused attempt leaves the live session's cache alone.
    fn settle_cache<T>(&self, config: &ServerConfig, outcome: &Result<T>) {
        if matches!(outcome, Err(BridgeError::AlreadyConnected(_))) {
            return;
        }
        if let Some(limit) = config.cache.max_entries {
            self.cache.set_server_limit(&config.name, limit);
        }
        // A new session must not see payloads cached by the previous one.
        self.cache.invalidate_server(&config.name);
    }

    /// Connect one server through its configured transport.
    pub async fn connect(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        let outcome = self.manager.connect(config.clone()).await;
        self.settle_cache(&config, &outcome);
        outcome.map(|_| ())
    }

    /// Connect one server over a caller-supplied connection.
    pub async fn connect_with(
        &self,
        config: ServerConfig,
        connection: crate::transport::Connection,
    ) -> Result<()> {
        config.validate()?;
        let outcome = self.manager.connect_with(config.clone(), connection).await;
        self.settle_cache(&config, &outcome);
        outcome.map(|_| ())
    }

    /// Connect servers concurrently. A failure affects only its own server.
    pub async fn connect_all(
        &self,
        configs: impl IntoIterator<Item = ServerConfig>,
    ) -> Vec<(String, Result<()>)> {
        let mut results: Vec<(String, Result<()>)> = Vec::new();
        let mut ready = HashMap::new();

        for config in configs.into_iter().filter(|c| c.enabled) {
            match config.validate() {
                Ok(()) => {
                    ready.insert(config.name.clone(), config);
                }
                Err(e) => results.push((config.name.clone(), Err(e.into()))),
            }
        }

        for (name, outcome) in self.manager.connect_all(ready.values().cloned()).await {
            if let Some(config) = ready.get(&name) {
                self.settle_cache(config, &outcome);
            }
            results.push((name, outcome));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Connect every enabled server from the configuration given to [`Bridge::new`].
    pub async fn connect_configured(&self) -> Vec<(String, Result<()>)> {
        self.connect_all(self.servers.clone()).await
    }

    /// Disconnect one server. Its cache entries and local subscriptions are dropped.
    pub async fn disconnect(&self, server: &str) -> Result<()> {
        self.manager.disconnect(server).await?;
        self.cache.invalidate_server(server);
        let dropped = self.subscriptions.remove_server(server);
        if dropped > 0 {
            debug!(server, dropped, "Dropped resource subscriptions");
        }
        Ok(())
    }

    /// Disconnect every server and clear local state.
    pub async fn shutdown(&self) {
        self.manager.disconnect_all().await;
        self.cache.clear();
        self.subscriptions.clear();
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn status(&self, server: &str) -> Option<ServerStatus> {
        self.manager.status(server)
    }

    pub fn statuses(&self) -> Vec<(String, ServerStatus)> {
        self.manager.statuses()
    }

    pub fn summaries(&self) -> Vec<ServerSummary> {
        self.manager.summaries()
    }

    pub fn capabilities(&self, server: &str) -> Option<Capabilities> {
        self.manager.capabilities(server)
    }

    pub fn server_info(&self, server: &str) -> Option<ServerInfo> {
        self.manager.server_info(server)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.manager.server_names()
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Invoke a tool with the server's default options.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolResult> {
        self.call_tool_with(server, tool, arguments, &CallOptions::default())
            .await
    }

    /// Invoke a tool.
    ///
    /// A result flagged `isError` is a successful call; the invoked event
    /// carries the flag.
    pub async fn call_tool_with(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<ToolResult> {
        let start = Instant::now();
        self.events.emit(BridgeEvent::ToolInvokeRequested {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments: arguments.clone(),
        });

        match self.try_call_tool(server, tool, arguments, options).await {
            Ok(result) => {
                self.events.emit(BridgeEvent::ToolInvoked {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    is_error: result.is_error,
                    duration_ms: elapsed_ms(start),
                });
                Ok(result)
            }
            Err(e) => {
                self.events.emit(BridgeEvent::ToolInvokeError {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<ToolResult> {
        require_non_empty("server", server)?;
        require_non_empty("tool name", tool)?;
        let arguments = object_arguments(arguments)?;

        let client = self.manager.client(server)?;
        client.ensure_ready(Some(Capability::Tools))?;
        client.call_tool(tool, arguments, options).await
    }

    /// Invoke a tool by its qualified name, `mcp__<server>__<tool>`.
    pub async fn call_qualified_tool(&self, qualified: &str, arguments: Value) -> Result<ToolResult> {
        let (server, tool) = split_qualified(qualified).ok_or_else(|| {
            BridgeError::validation(format!("'{}' is not a qualified MCP tool name", qualified))
        })?;
        self.call_tool(server, tool, arguments).await
    }

    /// List one server's tools.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolInfo>> {
        self.listed(server, ListKind::Tools, |client| async move {
            client.list_tools().await
        })
        .await
    }

    /// Tools of every live server that negotiated `tools`, sorted by
    /// qualified name. Servers that fail to list are skipped.
    pub async fn list_all_tools(&self) -> Vec<ToolInfo> {
        let mut tools = Vec::new();

        for client in self.manager.connected_clients() {
            if !client.capabilities().tools {
                continue;
            }
            match self.list_tools(client.name()).await {
                Ok(listed) => tools.extend(listed),
                Err(e) => warn!(server = client.name(), error = %e, "Failed to list tools"),
            }
        }

        tools.sort_by_key(|t| t.qualified_name());
        tools
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Read a resource, serving from the cache when allowed.
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult> {
        self.read_resource_with(server, uri, &CallOptions::default())
            .await
    }

    /// Read a resource with explicit call options.
    pub async fn read_resource_with(
        &self,
        server: &str,
        uri: &str,
        options: &CallOptions,
    ) -> Result<ReadResourceResult> {
        let start = Instant::now();
        self.events.emit(BridgeEvent::ResourceReadRequested {
            server: server.to_string(),
            uri: uri.to_string(),
        });

        match self.try_read_resource(server, uri, options).await {
            Ok((result, cached)) => {
                self.events.emit(BridgeEvent::ResourceRead {
                    server: server.to_string(),
                    uri: uri.to_string(),
                    cached,
                    duration_ms: elapsed_ms(start),
                });
                Ok(result)
            }
            Err(e) => {
                self.events.emit(BridgeEvent::ResourceReadError {
                    server: server.to_string(),
                    uri: uri.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_read_resource(
        &self,
        server: &str,
        uri: &str,
        options: &CallOptions,
    ) -> Result<(ReadResourceResult, bool)> {
        require_non_empty("server", server)?;
        require_non_empty("uri", uri)?;

        let client = self.manager.client(server)?;
        // Guard first: a cached payload is never served for a server that
        // is not operating with `resources`.
        client.ensure_ready(Some(Capability::Resources))?;

        let cache_config = &client.config().cache;
        if cache_config.enabled {
            let hit = self.cache.get(server, uri);

            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_cache(hit.is_some());

            if let Some(payload) = hit {
                match serde_json::from_value(payload) {
                    Ok(result) => {
                        debug!(server, uri, "cache hit");
                        return Ok((result, true));
                    }
                    Err(e) => {
                        warn!(server, uri, error = %e, "Discarding unreadable cache entry");
                        self.cache.invalidate(server, uri);
                    }
                }
            }
        }

        let result = client.read_resource(uri, options).await?;

        if cache_config.enabled {
            self.cache
                .put(server, uri, serde_json::to_value(&result)?, cache_config.ttl());
        }

        Ok((result, false))
    }

    /// List one server's resources.
    pub async fn list_resources(&self, server: &str) -> Result<Vec<ResourceInfo>> {
        self.listed(server, ListKind::Resources, |client| async move {
            client.list_resources().await
        })
        .await
    }

    /// Register `callback` for updates to `uri`.
    ///
    /// The first local subscriber of a URI sends `resources/subscribe` to the
    /// server; if that fails nothing is registered. Concurrent subscribers of
    /// the same URI wait for that request to settle.
    pub async fn subscribe_to_resource<F>(
        &self,
        server: &str,
        uri: &str,
        callback: F,
    ) -> Result<ResourceSubscription>
    where
        F: Fn(&ResourceUpdate) + Send + Sync + 'static,
    {
        require_non_empty("server", server)?;
        require_non_empty("uri", uri)?;

        let client = self.manager.client(server)?;
        client.ensure_ready(Some(Capability::Resources))?;

        let gate = self.subscriptions.gate(server, uri);
        let _settled = gate.lock().await;

        let (id, first) = self.subscriptions.add(server, uri, Arc::new(callback));
        if first {
            if let Err(e) = client.subscribe_resource(uri).await {
                self.subscriptions.remove(server, uri, id);
                return Err(e);
            }
            debug!(server, uri, "Subscribed to resource");
        }

        Ok(ResourceSubscription {
            id,
            server: server.to_string(),
            uri: uri.to_string(),
        })
    }

    /// Drop a subscription. When the last local subscriber of a URI leaves,
    /// `resources/unsubscribe` is sent on a best-effort basis. Returns
    /// whether the subscription was still registered.
    pub async fn unsubscribe(&self, subscription: ResourceSubscription) -> bool {
        let ResourceSubscription { id, server, uri } = subscription;

        let gate = self.subscriptions.gate(&server, &uri);
        let _settled = gate.lock().await;

        let Some(last) = self.subscriptions.remove(&server, &uri, id) else {
            return false;
        };

        if last {
            if let Ok(client) = self.manager.client(&server) {
                if client.state() == SessionState::Operating {
                    if let Err(e) = client.unsubscribe_resource(&uri).await {
                        debug!(server = %server, uri = %uri, error = %e, "unsubscribe failed");
                    }
                }
            }
        }
        true
    }

    /// Local subscribers of `(server, uri)`.
    pub fn subscriber_count(&self, server: &str, uri: &str) -> usize {
        self.subscriptions.count(server, uri)
    }

    // ========================================================================
    // Prompts
    // ========================================================================

    /// Render a prompt with the server's default options.
    pub async fn get_prompt(&self, server: &str, prompt: &str, arguments: Value) -> Result<GetPromptResult> {
        self.get_prompt_with(server, prompt, arguments, &CallOptions::default())
            .await
    }

    /// Render a prompt.
    pub async fn get_prompt_with(
        &self,
        server: &str,
        prompt: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<GetPromptResult> {
        let start = Instant::now();
        self.events.emit(BridgeEvent::PromptGetRequested {
            server: server.to_string(),
            prompt: prompt.to_string(),
        });

        let outcome = async {
            require_non_empty("server", server)?;
            require_non_empty("prompt name", prompt)?;
            let arguments = object_arguments(arguments)?;

            let client = self.manager.client(server)?;
            client.ensure_ready(Some(Capability::Prompts))?;
            client.get_prompt(prompt, arguments, options).await
        }
        .await;

        match outcome {
            Ok(result) => {
                self.events.emit(BridgeEvent::PromptGot {
                    server: server.to_string(),
                    prompt: prompt.to_string(),
                    duration_ms: elapsed_ms(start),
                });
                Ok(result)
            }
            Err(e) => {
                self.events.emit(BridgeEvent::PromptGetError {
                    server: server.to_string(),
                    prompt: prompt.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// List one server's prompts.
    pub async fn list_prompts(&self, server: &str) -> Result<Vec<PromptInfo>> {
        self.listed(server, ListKind::Prompts, |client| async move {
            client.list_prompts().await
        })
        .await
    }

    async fn listed<T, F, Fut>(&self, server: &str, list: ListKind, fetch: F) -> Result<Vec<T>>
    where
        F: FnOnce(Arc<McpClient>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        self.events.emit(BridgeEvent::ListRequested {
            server: server.to_string(),
            list,
        });

        let outcome = async {
            require_non_empty("server", server)?;
            let client = self.manager.client(server)?;
            client.ensure_ready(Some(match list {
                ListKind::Tools => Capability::Tools,
                ListKind::Resources => Capability::Resources,
                ListKind::Prompts => Capability::Prompts,
            }))?;
            fetch(client).await
        }
        .await;

        match &outcome {
            Ok(items) => self.events.emit(BridgeEvent::Listed {
                server: server.to_string(),
                list,
                count: items.len(),
            }),
            Err(e) => self.events.emit(BridgeEvent::ListError {
                server: server.to_string(),
                list,
                error: e.to_string(),
            }),
        }
        outcome
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("servers", &self.manager.server_names())
            .field("cache", &self.cache.stats())
            .finish()
    }
}
