// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol: JSON-RPC 2.0 framing and the MCP payloads carried over it.

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    codes, decode, encode, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JSONRPC_VERSION,
};
pub use types::*;

/// Method names used by the bridge.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCE_UPDATED: &str = "notifications/resources/updated";
    pub const RESOURCE_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const TOOL_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PROMPT_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const CANCELLED: &str = "notifications/cancelled";
}
