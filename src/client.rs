// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! MCP client for a single server.
//!
//! [`McpClient`] owns one session: the lifecycle state machine, the request
//! correlator and the transport. A background reader task drains the
//! transport, resolves responses, forwards notifications and answers the
//! few requests a server may send to its client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::correlator::{Correlator, PendingGuard};
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::{
    codes, methods, GetPromptResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPage, PromptInfo,
    ReadResourceResult, ResourceInfo, ServerInfo, ToolInfo, ToolResult,
};
use crate::retry::RetryPolicy;
use crate::session::{Capabilities, Capability, Session, SessionState};
use crate::transport::{Connection, Inbound, Transport, TransportEvent};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;
#[cfg(feature = "telemetry")]
use tokio::time::Instant;

/// Receives server notifications: `(server, notification)`.
pub type NotificationSink = Arc<dyn Fn(&str, &JsonRpcNotification) + Send + Sync>;

/// Upper bound on pages fetched by one `*/list` operation.
const MAX_LIST_PAGES: usize = 100;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-attempt timeout; defaults to the server's `request_timeout_ms`.
    pub timeout: Option<Duration>,

    /// Overall deadline covering every attempt and backoff sleep.
    pub deadline: Option<Duration>,

    /// Retry policy; defaults to the server's.
    pub retry: Option<RetryPolicy>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

struct Shared {
    name: String,
    session: Mutex<Session>,
    correlator: Correlator,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    explicit_shutdown: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    /// Transport went away underneath us.
    fn on_closed(&self, reason: Option<String>) {
        if self.explicit_shutdown.load(Ordering::SeqCst) {
            debug!(server = %self.name, "transport closed after disconnect");
            self.correlator.fail_all();
            return;
        }

        let was_live = self.session().shutdown();
        let failed = self.correlator.fail_all();
        let message = reason.unwrap_or_else(|| "connection closed".to_string());

        warn!(
            server = %self.name,
            reason = %message,
            failed_requests = failed,
            "Lost connection to MCP server"
        );
        self.set_last_error(message.clone());

        if was_live {
            self.events.emit(BridgeEvent::ServerError {
                server: self.name.clone(),
                error: message,
            });
        }
    }

    /// Answer a server-initiated request.
    async fn answer(&self, request: JsonRpcRequest) {
        let response = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            debug!(server = %self.name, method = %request.method, "Rejecting server request");
            JsonRpcResponse::failure(
                request.id,
                JsonRpcError::new(
                    codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", request.method),
                ),
            )
        };

        if let Err(e) = self.transport.send(&response.into()).await {
            debug!(server = %self.name, error = %e, "Failed to answer server request");
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut inbound: Inbound, sink: Option<NotificationSink>) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Message(JsonRpcMessage::Response(response)) => {
                match response.numeric_id() {
                    Some(id) => {
                        shared.correlator.resolve(id, response.into_result());
                    }
                    None => warn!(
                        server = %shared.name,
                        id = %response.id,
                        "Discarding response with non-numeric id"
                    ),
                }
            }
            TransportEvent::Message(JsonRpcMessage::Notification(notification)) => {
                debug!(server = %shared.name, method = %notification.method, "Notification");
                if let Some(sink) = &sink {
                    sink(&shared.name, &notification);
                }
            }
            TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                shared.answer(request).await;
            }
            TransportEvent::Closed { reason } => {
                shared.on_closed(reason);
                return;
            }
        }
    }
    shared.on_closed(None);
}

/// Client for one MCP server session.
pub struct McpClient {
    shared: Arc<Shared>,
    config: ServerConfig,
    client_name: String,
    server_info: Mutex<Option<InitializeResult>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Wrap an open connection and start its reader task.
    ///
    /// The session starts `Uninitialized`; call [`McpClient::initialize`].
    pub fn start(
        config: ServerConfig,
        client_name: impl Into<String>,
        connection: Connection,
        events: Arc<EventBus>,
        sink: Option<NotificationSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            session: Mutex::new(Session::new(config.name.clone())),
            correlator: Correlator::new(config.name.clone(), config.max_outstanding_requests),
            transport: connection.transport,
            events,
            explicit_shutdown: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), connection.inbound, sink));

        Self {
            shared,
            config,
            client_name: client_name.into(),
            server_info: Mutex::new(None),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.session().state()
    }

    /// Negotiated capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.shared.session().capabilities()
    }

    /// Server information reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.handshake().map(|r| r.server_info)
    }

    /// Full handshake result.
    pub fn handshake(&self) -> Option<InitializeResult> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last error that ended or broke the session.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the session ended because the transport was lost.
    pub fn is_lost(&self) -> bool {
        self.state() == SessionState::Shutdown && !self.shared.explicit_shutdown.load(Ordering::SeqCst)
    }

    /// Number of unresolved requests.
    pub fn outstanding(&self) -> usize {
        self.shared.correlator.outstanding()
    }

    /// The id the next request will carry.
    pub fn next_request_id(&self) -> u64 {
        self.shared.correlator.next_id()
    }

    /// Session guard for a capability.
    pub fn ensure_ready(&self, capability: Option<Capability>) -> Result<()> {
        self.shared.session().ensure_ready(capability)
    }

    /// Run the handshake: `initialize` → result → `notifications/initialized`.
    ///
    /// The whole exchange is bounded by `timeout`. On any failure the session
    /// is torn down to `Shutdown` and the transport closed.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        self.shared.session().begin_handshake()?;

        let result = match tokio::time::timeout(timeout, self.handshake_exchange()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.teardown(&e.to_string()).await;
                return Err(match e {
                    e @ BridgeError::ConnectionFailed { .. } => e,
                    other => BridgeError::connection_failed(self.name(), other.to_string()),
                });
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                self.teardown("handshake timed out").await;
                return Err(BridgeError::ConnectionTimeout {
                    server: self.name().to_string(),
                    timeout_ms,
                });
            }
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("mcp.client.initialize", start.elapsed());

        info!(
            server = %self.name(),
            remote = %result.server_info.name,
            version = %result.server_info.version,
            "Connected to MCP server"
        );
        Ok(result)
    }

    async fn handshake_exchange(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::new(
            &self.client_name,
            env!("CARGO_PKG_VERSION"),
        ))?;

        let value = self.exchange(methods::INITIALIZE, Some(params), None).await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidResponse(format!("initialize result: {}", e)))?;

        self.shared.session().complete_handshake(result.capabilities)?;
        *self.server_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());

        let ack: JsonRpcMessage = JsonRpcNotification::new(methods::INITIALIZED, None).into();
        self.shared.transport.send(&ack).await?;

        self.shared.session().mark_operating()?;
        Ok(result)
    }

    async fn teardown(&self, reason: &str) {
        self.shared.explicit_shutdown.store(true, Ordering::SeqCst);
        self.shared.session().shutdown();
        self.shared.correlator.fail_all();
        self.shared.set_last_error(reason);
        if let Err(e) = self.shared.transport.close().await {
            debug!(server = %self.name(), error = %e, "close failed during teardown");
        }
    }

    /// One request/response exchange, without guard or retry.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let correlator = &self.shared.correlator;
        let issued = correlator.issue(method)?;
        let _pending = PendingGuard::new(correlator, issued.id);

        let id = issued.id;
        let receiver = issued.receiver;
        let request: JsonRpcMessage = JsonRpcRequest::new(id, method, params).into();

        // The deadline covers the write as well as the wait for the reply.
        let round_trip = async {
            self.shared.transport.send(&request).await?;
            receiver
                .await
                .map_err(|_| BridgeError::connection_closed(self.name()))?
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, round_trip).await {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(server = %self.name(), id, method, "Request timed out");
                    self.send_cancelled(id, limit).await;
                    Err(BridgeError::Timeout {
                        server: self.name().to_string(),
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => round_trip.await,
        }
    }

    /// Best-effort `notifications/cancelled`, bounded by `limit`.
    async fn send_cancelled(&self, id: u64, limit: Duration) {
        let notice: JsonRpcMessage = JsonRpcNotification::new(
            methods::CANCELLED,
            Some(json!({"requestId": id, "reason": "timeout"})),
        )
        .into();
        if tokio::time::timeout(limit, self.shared.transport.send(&notice))
            .await
            .is_err()
        {
            debug!(server = %self.name(), id, "cancel notice not delivered");
        }
    }

    /// Send a request with the server's default options.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call(method, params, &CallOptions::default()).await
    }

    /// Send a request: session guard, then correlator + transport, with retry
    /// on transient failures. Each attempt carries a fresh id.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let policy = options.retry.as_ref().unwrap_or(&self.config.retry);
        let attempt_timeout = options.timeout.unwrap_or_else(|| self.config.request_timeout());

        let attempts = policy.run(method, |attempt| {
            let params = params.clone();
            async move {
                if attempt > 1 {
                    debug!(server = %self.name(), method, attempt, "Retrying request");
                }
                self.shared.session().ensure_method_allowed(method)?;
                self.exchange(method, params, Some(attempt_timeout)).await
            }
        });

        let result = match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, attempts).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout {
                    server: self.name().to_string(),
                    method: method.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                }),
            },
            None => attempts.await,
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_call(method, start.elapsed(), result.is_ok());

        result
    }

    async fn list_paged<T: DeserializeOwned>(&self, method: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.request(method, params).await?;
            let page: ListPage<T> = serde_json::from_value(value)
                .map_err(|e| BridgeError::InvalidResponse(format!("{}: {}", method, e)))?;
            items.extend(page.items);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(items),
            }
        }

        warn!(server = %self.name(), method, "Stopped paging after {} pages", MAX_LIST_PAGES);
        Ok(items)
    }

    /// List the server's tools, minus those disabled by configuration.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools: Vec<ToolInfo> = self.list_paged(methods::TOOLS_LIST).await?;
        tools.retain(|t| self.config.is_tool_enabled(&t.name));
        for tool in &mut tools {
            tool.server = self.name().to_string();
        }
        Ok(tools)
    }

    /// List the server's resources.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        self.list_paged(methods::RESOURCES_LIST).await
    }

    /// List the server's prompts.
    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>> {
        self.list_paged(methods::PROMPTS_LIST).await
    }

    /// Invoke a tool. A result flagged `isError` is returned as `Ok`; a
    /// JSON-RPC error becomes `ToolExecution`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<ToolResult> {
        if !self.config.is_tool_enabled(tool) {
            return Err(BridgeError::validation(format!(
                "tool '{}' is disabled on server '{}'",
                tool,
                self.name()
            )));
        }

        let params = json!({ "name": tool, "arguments": arguments });
        let value = self
            .call(methods::TOOLS_CALL, Some(params), options)
            .await
            .map_err(|e| match e {
                BridgeError::Rpc { message, .. } => BridgeError::ToolExecution {
                    server: self.name().to_string(),
                    tool: tool.to_string(),
                    message,
                },
                other => other,
            })?;

        serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidResponse(format!("tools/call result: {}", e)))
    }

    /// Read a resource. A JSON-RPC error becomes `ResourceRead`.
    pub async fn read_resource(&self, uri: &str, options: &CallOptions) -> Result<ReadResourceResult> {
        let value = self
            .call(methods::RESOURCES_READ, Some(json!({ "uri": uri })), options)
            .await
            .map_err(|e| match e {
                BridgeError::Rpc { message, .. } => BridgeError::ResourceRead {
                    server: self.name().to_string(),
                    uri: uri.to_string(),
                    message,
                },
                other => other,
            })?;

        serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidResponse(format!("resources/read result: {}", e)))
    }

    /// Render a prompt. A JSON-RPC error becomes `PromptGet`.
    pub async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<GetPromptResult> {
        let mut params = json!({ "name": prompt });
        if !arguments.is_null() {
            params["arguments"] = arguments;
        }

        let value = self
            .call(methods::PROMPTS_GET, Some(params), options)
            .await
            .map_err(|e| match e {
                BridgeError::Rpc { message, .. } => BridgeError::PromptGet {
                    server: self.name().to_string(),
                    prompt: prompt.to_string(),
                    message,
                },
                other => other,
            })?;

        serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidResponse(format!("prompts/get result: {}", e)))
    }

    /// Ask the server to push updates for `uri`.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.request(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// Stop server pushes for `uri`.
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Shut the session down: state → `Shutdown`, pending requests fail with
    /// `ConnectionClosed`, transport closed. Returns `false` if it was
    /// already shut down.
    pub async fn disconnect(&self) -> bool {
        self.shared.explicit_shutdown.store(true, Ordering::SeqCst);
        let changed = self.shared.session().shutdown();
        let failed = self.shared.correlator.fail_all();

        if let Err(e) = self.shared.transport.close().await {
            debug!(server = %self.name(), error = %e, "close failed");
        }

        if changed {
            info!(server = %self.name(), failed_requests = failed, "Disconnected from MCP server");
        }
        changed
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("transport", &self.shared.transport.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{handshake_result, pair, MemoryPeer};

    fn config() -> ServerConfig {
        ServerConfig::stdio("alpha", "unused")
            .with_retry(RetryPolicy::none())
            .with_request_timeout(Duration::from_millis(500))
    }

    async fn connected(caps: Capabilities) -> (McpClient, MemoryPeer) {
        let (conn, mut peer) = pair("alpha");
        let client = McpClient::start(config(), "test", conn, Arc::new(EventBus::new()), None);

        let handshake = async {
            let req = peer.recv_request().await.unwrap();
            assert_eq!(req.method, "initialize");
            assert_eq!(req.numeric_id(), Some(1));
            peer.respond(req.id, handshake_result("fake", caps));
        };
        let (result, _) = tokio::join!(client.initialize(Duration::from_secs(1)), handshake);
        result.unwrap();
        (client, peer)
    }

    #[tokio::test]
    async fn test_handshake() {
        let (client, mut peer) = connected(Capabilities::default().with(Capability::Tools, true)).await;

        assert_eq!(client.state(), SessionState::Operating);
        assert!(client.capabilities().tools);
        assert!(!client.capabilities().resources);
        assert_eq!(client.server_info().unwrap().name, "fake");
        assert_eq!(client.next_request_id(), 2);

        let ack = peer.recv().await.unwrap();
        assert_eq!(ack.method(), Some("notifications/initialized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (conn, _peer) = pair("alpha");
        let client = McpClient::start(config(), "test", conn, Arc::new(EventBus::new()), None);

        let err = client.initialize(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionTimeout { timeout_ms: 100, .. }));
        assert_eq!(client.state(), SessionState::Shutdown);
        assert!(!client.is_lost());
    }

    #[tokio::test]
    async fn test_handshake_error_response() {
        let (conn, mut peer) = pair("alpha");
        let client = McpClient::start(config(), "test", conn, Arc::new(EventBus::new()), None);

        let server = async {
            let req = peer.recv_request().await.unwrap();
            peer.respond_error(req.id, codes::INVALID_REQUEST, "unsupported version");
        };
        let (result, _) = tokio::join!(client.initialize(Duration::from_secs(1)), server);

        assert!(matches!(result, Err(BridgeError::ConnectionFailed { .. })));
        assert_eq!(client.state(), SessionState::Shutdown);
    }

    #[tokio::test]
    async fn test_request_resolves() {
        let (client, mut peer) = connected(Capabilities::all()).await;
        let server = async {
            let req = peer.recv_request().await.unwrap();
            assert_eq!(req.method, "tools/list");
            assert_eq!(req.numeric_id(), Some(2));
            peer.respond(req.id, json!({"tools": [{"name": "echo"}]}));
        };

        let (tools, _) = tokio::join!(client.list_tools(), server);
        let tools = tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server, "alpha");
        assert_eq!(tools[0].qualified_name(), "mcp__alpha__echo");
    }

    #[tokio::test]
    async fn test_guard_blocks_missing_capability() {
        let (client, peer) = connected(Capabilities::default().with(Capability::Prompts, true)).await;
        let before = peer.send_attempts();

        let err = client
            .call_tool("echo", json!({}), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::CapabilityNotNegotiated { capability: Capability::Tools, .. }
        ));
        assert_eq!(peer.send_attempts(), before);
        assert_eq!(client.next_request_id(), 2);
    }

    #[tokio::test]
    async fn test_rpc_error_maps_to_tool_execution() {
        let (client, peer) = connected(Capabilities::all()).await;
        let _server = peer.serve(|_| {
            crate::transport::memory::PeerReply::Error(JsonRpcError::new(-32000, "tool exploded"))
        });

        let err = client
            .call_tool("echo", json!({}), &CallOptions::default())
            .await
            .unwrap_err();
        match err {
            BridgeError::ToolExecution { tool, message, .. } => {
                assert_eq!(tool, "echo");
                assert_eq!(message, "tool exploded");
            }
            other => panic!("expected ToolExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (client, mut peer) = connected(Capabilities::all()).await;
        let _ack = peer.recv().await;

        peer.request(77, "ping", None);
        peer.request(78, "sampling/createMessage", None);

        match peer.recv().await.unwrap() {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.numeric_id(), Some(77));
                assert!(r.error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match peer.recv().await.unwrap() {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.error.unwrap().code, codes::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected {:?}", other),
        }
        drop(client);
    }

    /// Forwards everything except `tools/call`, whose write never completes.
    struct StallingTransport {
        inner: Arc<dyn Transport>,
    }

    #[async_trait::async_trait]
    impl Transport for StallingTransport {
        async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
            if message.method() == Some(methods::TOOLS_CALL) {
                std::future::pending::<()>().await;
            }
            self.inner.send(message).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn kind(&self) -> &'static str {
            "stalling"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_stalled_send() {
        let (conn, mut peer) = pair("alpha");
        let conn = Connection::new(
            Arc::new(StallingTransport { inner: conn.transport }),
            conn.inbound,
        );
        let client = McpClient::start(config(), "test", conn, Arc::new(EventBus::new()), None);
        let server = async {
            let req = peer.recv_request().await.unwrap();
            peer.respond(req.id, handshake_result("fake", Capabilities::all()));
        };
        let (result, _) = tokio::join!(client.initialize(Duration::from_secs(1)), server);
        result.unwrap();

        let options = CallOptions::new().with_timeout(Duration::from_millis(50));
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            client.call_tool("echo", json!({}), &options),
        )
        .await
        .expect("call must not hang on a stalled write");

        assert!(matches!(
            outcome,
            Err(BridgeError::Timeout { timeout_ms: 50, .. })
        ));
        assert_eq!(client.outstanding(), 0);
        assert_eq!(client.state(), SessionState::Operating);

        let ack = peer.recv().await.unwrap();
        assert_eq!(ack.method(), Some("notifications/initialized"));
        match peer.recv().await.unwrap() {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, "notifications/cancelled");
                assert_eq!(n.params.unwrap()["requestId"], 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let (client, _peer) = connected(Capabilities::all()).await;
        let client = Arc::new(client);

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("tools/list", None).await })
        };
        while client.outstanding() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(client.disconnect().await);
        assert!(!client.disconnect().await);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed { .. }));
        assert_eq!(client.state(), SessionState::Shutdown);
        assert!(!client.is_lost());

        assert!(matches!(
            client.request("tools/list", None).await,
            Err(BridgeError::InvalidSessionState { state: SessionState::Shutdown, .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_loss() {
        let events = Arc::new(EventBus::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        events.subscribe(move |e| sink.lock().unwrap().push(e.name));

        let (conn, mut peer) = pair("alpha");
        let client = McpClient::start(config(), "test", conn, Arc::clone(&events), None);
        let server = async {
            let req = peer.recv_request().await.unwrap();
            peer.respond(req.id, handshake_result("fake", Capabilities::all()));
        };
        let (result, _) = tokio::join!(client.initialize(Duration::from_secs(1)), server);
        result.unwrap();

        peer.disconnect();
        while client.state() != SessionState::Shutdown {
            tokio::task::yield_now().await;
        }

        assert!(client.is_lost());
        assert_eq!(client.last_error().as_deref(), Some("connection lost"));
        assert_eq!(*errors.lock().unwrap(), vec!["mcp:server:error"]);
    }
}
