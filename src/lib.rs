// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! MCP Bridge - connect an application to many Model Context Protocol servers.
//!
//! The bridge owns one JSON-RPC session per server, drives each through the
//! MCP handshake, gates every call on the negotiated capabilities, retries
//! transient failures, caches resource reads and publishes an event for
//! every operation.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`bridge`] - Facade: tools, resources, prompts, subscriptions, events
//! - [`manager`] - Per-server session slots, connect/disconnect, status
//! - [`client`] - One server session: handshake, dispatch, reader task
//! - [`session`] - Lifecycle state machine and capability guard
//! - [`correlator`] - Request ids and the outstanding-request table
//! - [`retry`] - Exponential backoff for transient failures
//! - [`cache`] - LRU + TTL cache of resource reads
//! - [`events`] - Typed publish/subscribe event bus
//! - [`transport`] - Stdio, HTTP and in-memory transports
//! - [`protocol`] - JSON-RPC framing and MCP payload types
//! - [`config`] - Configuration files and server definitions
//! - [`error`] - Error types and result aliases
//! - [`telemetry`] - Logging setup and metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_bridge::{config::load_config, Bridge};
//! use serde_json::json;
//!
//! let config = load_config(".".as_ref(), None)?;
//! let bridge = Bridge::new(&config);
//!
//! for (server, result) in bridge.connect_configured().await {
//!     if let Err(e) = result {
//!         eprintln!("{}: {}", server, e);
//!     }
//! }
//!
//! let tools = bridge.list_all_tools().await;
//! let result = bridge.call_tool("filesystem", "read_file", json!({"path": "Cargo.toml"})).await?;
//! ```

pub mod bridge;
pub mod cache;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types at crate root
pub use bridge::{Bridge, ResourceSubscription, UpdateCallback};
pub use cache::{CacheBudget, CacheStats, ResponseCache};
pub use client::{CallOptions, McpClient};
pub use config::{BridgeConfig, ServerCacheConfig, ServerConfig, TransportType};
pub use error::{BridgeError, ConfigError, Result};
pub use events::{BridgeEvent, Event, EventBus, EventCategory, ListKind, SubscriptionId};
pub use manager::{ClientManager, ServerStatus, ServerSummary};
pub use protocol::{
    GetPromptResult, PromptInfo, ReadResourceResult, ResourceInfo, ResourceUpdate, ServerInfo,
    ToolInfo, ToolResult, PROTOCOL_VERSION,
};
pub use retry::RetryPolicy;
pub use session::{Capabilities, Capability, SessionState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
