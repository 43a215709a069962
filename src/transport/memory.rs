// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process transport.
//!
//! [`pair`] returns a client-side [`Connection`] and the [`MemoryPeer`] that
//! plays the server. The peer can answer requests, push notifications, drop
//! the connection, and make the next N client sends fail with a transient
//! transport error. Used by the integration tests and the benchmarks, and by
//! embedders that host a server in the same process.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Connection, InboundSender, Transport, TransportEvent};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION,
};
use crate::session::Capabilities;

struct Shared {
    server: String,
    inbound: InboundSender,
    closed: AtomicBool,
    fail_sends: AtomicU32,
    send_attempts: AtomicU64,
    received: Mutex<Vec<JsonRpcMessage>>,
}

impl Shared {
    fn close_with(&self, reason: Option<String>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inbound.send(TransportEvent::Closed { reason });
        true
    }
}

/// Client side of an in-memory connection.
pub struct MemoryTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::connection_closed(&shared.server));
        }

        shared.send_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = shared
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BridgeError::transport(&shared.server, "injected send failure"));
        }

        self.outbound
            .send(message.clone())
            .map_err(|_| BridgeError::transport(&shared.server, "peer is gone"))
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_with(None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// How a scripted peer answers one request.
#[derive(Debug, Clone)]
pub enum PeerReply {
    /// Successful result.
    Result(Value),

    /// JSON-RPC error object.
    Error(JsonRpcError),

    /// Never answer.
    Ignore,
}

/// Cloneable control handle for the server side.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

impl PeerHandle {
    /// Push any message to the client.
    pub fn send(&self, message: impl Into<JsonRpcMessage>) -> bool {
        self.shared
            .inbound
            .send(TransportEvent::Message(message.into()))
            .is_ok()
    }

    /// Answer request `id` with a result.
    pub fn respond(&self, id: impl Into<Value>, result: Value) -> bool {
        self.send(JsonRpcResponse::success(id, result))
    }

    /// Answer request `id` with an error object.
    pub fn respond_error(&self, id: impl Into<Value>, code: i64, message: &str) -> bool {
        self.send(JsonRpcResponse::failure(id, JsonRpcError::new(code, message)))
    }

    /// Push a notification to the client.
    pub fn notify(&self, method: &str, params: Option<Value>) -> bool {
        self.send(JsonRpcNotification::new(method, params))
    }

    /// Issue a server-initiated request.
    pub fn request(&self, id: u64, method: &str, params: Option<Value>) -> bool {
        self.send(JsonRpcRequest::new(id, method, params))
    }

    /// Simulate the connection dropping underneath the client.
    pub fn disconnect(&self) -> bool {
        self.shared.close_with(Some("connection lost".to_string()))
    }

    /// Make the next `n` client sends fail with a transport error.
    pub fn fail_next_sends(&self, n: u32) {
        self.shared.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Number of times the client tried to send, including injected failures.
    pub fn send_attempts(&self) -> u64 {
        self.shared.send_attempts.load(Ordering::SeqCst)
    }

    /// Whether either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Every message the peer has received so far.
    pub fn received(&self) -> Vec<JsonRpcMessage> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Method names of received requests and notifications, in order.
    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    fn record(&self, message: &JsonRpcMessage) {
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
    }
}

/// Server side of an in-memory connection.
pub struct MemoryPeer {
    handle: PeerHandle,
    outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
}

impl MemoryPeer {
    /// Next message from the client, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        let message = self.outbound.recv().await?;
        self.handle.record(&message);
        Some(message)
    }

    /// Next request from the client, skipping notifications and responses.
    pub async fn recv_request(&mut self) -> Option<JsonRpcRequest> {
        loop {
            if let JsonRpcMessage::Request(request) = self.recv().await? {
                return Some(request);
            }
        }
    }

    /// Cloneable control handle.
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Answer every request with `handler` on a background task.
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&JsonRpcRequest) -> PeerReply + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.recv_request().await {
                match handler(&request) {
                    PeerReply::Result(result) => {
                        self.handle.respond(request.id.clone(), result);
                    }
                    PeerReply::Error(error) => {
                        self.handle
                            .send(JsonRpcResponse::failure(request.id.clone(), error));
                    }
                    PeerReply::Ignore => {}
                }
            }
        })
    }
}

impl Deref for MemoryPeer {
    type Target = PeerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

/// Create a connected client/peer pair.
pub fn pair(server: impl Into<String>) -> (Connection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        server: server.into(),
        inbound: inbound_tx,
        closed: AtomicBool::new(false),
        fail_sends: AtomicU32::new(0),
        send_attempts: AtomicU64::new(0),
        received: Mutex::new(Vec::new()),
    });

    let transport = MemoryTransport {
        shared: Arc::clone(&shared),
        outbound: outbound_tx,
    };
    let peer = MemoryPeer {
        handle: PeerHandle { shared },
        outbound: outbound_rx,
    };

    (Connection::new(Arc::new(transport), inbound_rx), peer)
}

/// A well-formed `initialize` result advertising `capabilities`.
pub fn handshake_result(server_name: &str, capabilities: Capabilities) -> Value {
    let advertise = |on: bool| if on { json!({}) } else { Value::Null };
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": advertise(capabilities.tools),
            "resources": advertise(capabilities.resources),
            "prompts": advertise(capabilities.prompts),
            "sampling": advertise(capabilities.sampling),
        },
        "serverInfo": {"name": server_name, "version": "1.0.0"}
    })
}
