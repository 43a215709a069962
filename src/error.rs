// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the MCP bridge.
//!
//! [`BridgeError`] is the single taxonomy surfaced to callers of the bridge,
//! the client manager and the per-server clients. Configuration loading has its
//! own [`ConfigError`], which converts into `BridgeError::Config`.

use thiserror::Error;

use crate::session::{Capability, SessionState};

/// Errors that can occur during bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No session exists for the server name.
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    /// A session for the server is already connecting or connected.
    #[error("MCP server '{0}' is already connected")]
    AlreadyConnected(String),

    /// The transport could not be established.
    #[error("Failed to connect to MCP server '{server}': {message}")]
    ConnectionFailed { server: String, message: String },

    /// The handshake did not complete within the connect window.
    #[error("Connection to MCP server '{server}' timed out after {timeout_ms}ms")]
    ConnectionTimeout { server: String, timeout_ms: u64 },

    /// The session was disconnected or the transport was lost.
    #[error("Connection to MCP server '{server}' closed")]
    ConnectionClosed { server: String },

    /// Transient transport failure while sending a message.
    #[error("Transport error on '{server}': {message}")]
    Transport { server: String, message: String },

    /// A request exceeded its deadline.
    #[error("Request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Call attempted outside the Operating state.
    #[error("MCP server '{server}' is in state {state}, expected operating")]
    InvalidSessionState { server: String, state: SessionState },

    /// Call requires a capability the server did not advertise.
    #[error("MCP server '{server}' did not negotiate the {capability} capability")]
    CapabilityNotNegotiated {
        server: String,
        capability: Capability,
    },

    /// Backpressure ceiling reached.
    #[error("MCP server '{server}' has {limit} outstanding requests")]
    TooManyOutstandingRequests { server: String, limit: usize },

    /// The server reported a tool failure.
    #[error("Tool '{tool}' on '{server}' failed: {message}")]
    ToolExecution {
        server: String,
        tool: String,
        message: String,
    },

    /// The server reported a resource read failure.
    #[error("Reading '{uri}' from '{server}' failed: {message}")]
    ResourceRead {
        server: String,
        uri: String,
        message: String,
    },

    /// The server reported a prompt retrieval failure.
    #[error("Prompt '{prompt}' on '{server}' failed: {message}")]
    PromptGet {
        server: String,
        prompt: String,
        message: String,
    },

    /// JSON-RPC error object returned by the server.
    #[error("Protocol error: code={code}, message={message}")]
    Rpc { code: i64, message: String },

    /// Malformed arguments caught before dispatch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The server sent something that does not fit the protocol.
    #[error("Invalid response from MCP server: {0}")]
    InvalidResponse(String),

    /// Transient failures persisted through every retry attempt.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<BridgeError>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a connection failed error.
    pub fn connection_failed(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(server: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            server: server.into(),
        }
    }

    /// Create a transient transport error.
    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Check if this error is transient and may be retried.
    ///
    /// Only transport-level failures and timeouts qualify. Anything the server
    /// reported itself, and anything about session state, is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Check if this error was reported by the server application.
    pub fn is_application_error(&self) -> bool {
        matches!(
            self,
            Self::Rpc { .. }
                | Self::ToolExecution { .. }
                | Self::ResourceRead { .. }
                | Self::PromptGet { .. }
        )
    }

    /// The underlying error, looking through `RetriesExhausted`.
    pub fn root(&self) -> &BridgeError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Whether the root cause is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
