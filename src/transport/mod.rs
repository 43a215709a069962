// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport layer.
//!
//! A transport moves JSON-RPC messages between the bridge and one server. The
//! outbound half is the [`Transport`] trait; the inbound half is a channel of
//! [`TransportEvent`]s drained by the client's reader task. Transports know
//! nothing about ids, sessions or retries.
//!
//! Implementations:
//! - [`StdioTransport`]: child process, newline-delimited JSON on stdin/stdout
//! - [`HttpTransport`]: JSON-RPC over HTTP POST
//! - [`memory`]: in-process pair used by tests and embedders

mod http;
pub mod memory;
mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ServerConfig, TransportType};
use crate::error::Result;
use crate::protocol::JsonRpcMessage;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Something that arrived from the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded JSON-RPC message.
    Message(JsonRpcMessage),

    /// The transport is gone. No further events follow.
    Closed { reason: Option<String> },
}

/// Receiving half of a connection.
pub type Inbound = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half used by transport implementations.
pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// Outbound side of a server connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message. Failures map to `BridgeError::Transport`.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Whether the transport still accepts messages.
    fn is_connected(&self) -> bool;

    /// Short transport name for logs.
    fn kind(&self) -> &'static str;
}

/// An open connection: the outbound handle plus the inbound stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub inbound: Inbound,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, inbound: Inbound) -> Self {
        Self { transport, inbound }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.transport.kind())
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

/// Open the transport described by `config`.
pub async fn open(config: &ServerConfig) -> Result<Connection> {
    match config.transport {
        TransportType::Stdio => StdioTransport::spawn(config).await,
        TransportType::Http => HttpTransport::connect(config),
    }
}
