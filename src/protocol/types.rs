// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! MCP payload types for the handshake, tools, resources and prompts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Capabilities;

/// Protocol version sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Prefix used for qualified tool names.
pub const QUALIFIED_PREFIX: &str = "mcp__";

/// Name and version of a client or server implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            version: "0.0.0".to_string(),
        }
    }
}

/// Server information reported during initialization.
pub type ServerInfo = Implementation;

/// Params of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

impl InitializeParams {
    /// Params for this client. Only client-side capabilities are requested;
    /// the server's set comes back in the result.
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({
                "roots": { "listChanged": false },
                "sampling": {}
            }),
            client_info: Implementation {
                name: client_name.into(),
                version: client_version.into(),
            },
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Behavior hints a server attaches to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

/// Information about an MCP tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,

    /// Tool description.
    #[serde(default)]
    pub description: Option<String>,

    /// JSON Schema for tool input.
    #[serde(default)]
    pub input_schema: Value,

    #[serde(default)]
    pub annotations: ToolAnnotations,

    /// Server this tool belongs to. Filled in by the bridge.
    #[serde(default)]
    pub server: String,
}

impl ToolInfo {
    /// Qualified name: `mcp__<server>__<tool>`.
    pub fn qualified_name(&self) -> String {
        qualify(&self.server, &self.name)
    }

    pub fn is_destructive(&self) -> bool {
        self.annotations.destructive_hint.unwrap_or(false)
    }

    pub fn is_read_only(&self) -> bool {
        self.annotations.read_only_hint.unwrap_or(false)
    }
}

/// Build a qualified tool name.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{}{}__{}", QUALIFIED_PREFIX, server, tool)
}

/// Split a qualified tool name into `(server, tool)`.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(QUALIFIED_PREFIX)?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Content returned by tools and prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Plain text content.
    Text { text: String },

    /// Base64-encoded image.
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },

    /// Embedded resource.
    Resource { resource: ResourceContents },

    /// A content type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result of a `tools/call` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Content>,

    /// The tool ran but reports a failure of its own.
    #[serde(default)]
    pub is_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolResult {
    /// Create a successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
            structured_content: None,
        }
    }

    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            structured_content: None,
        }
    }

    /// Get the text content as a single string.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Contents of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64-encoded binary contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Result of a `resources/read` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

impl ReadResourceResult {
    /// Concatenated text of all text contents.
    pub fn as_text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An argument a prompt template accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A prompt advertised by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One message of a rendered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Content,
}

/// Result of a `prompts/get` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

/// One page of a `*/list` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T> {
    #[serde(default = "Vec::new", alias = "tools", alias = "resources", alias = "prompts")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Server-pushed notice that a resource changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub server: String,
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_info_qualified_name() {
        let mut tool: ToolInfo = serde_json::from_value(json!({
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object"},
            "annotations": {"readOnlyHint": true}
        }))
        .unwrap();
        tool.server = "filesystem".to_string();

        assert_eq!(tool.qualified_name(), "mcp__filesystem__read_file");
        assert!(tool.is_read_only());
        assert!(!tool.is_destructive());
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(
            split_qualified("mcp__my_server__read_file"),
            Some(("my_server", "read_file"))
        );
        assert_eq!(split_qualified("read_file"), None);
        assert_eq!(split_qualified("mcp__server"), None);
        assert_eq!(split_qualified("mcp____tool"), None);
    }

    #[test]
    fn test_tool_result_text() {
        let result = ToolResult::text("Hello, world!");
        assert!(!result.is_error);
        assert_eq!(result.as_text(), "Hello, world!");

        let result = ToolResult::error("Something went wrong");
        assert!(result.is_error);
    }

    #[test]
    fn test_tool_result_parsing() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                {"type": "audio", "data": "..."},
                {"type": "resource", "resource": {"uri": "file:///x", "text": "inline"}}
            ],
            "isError": true
        }))
        .unwrap();

        assert!(result.is_error);
        assert_eq!(result.content.len(), 4);
        assert_eq!(result.content[2], Content::Unknown);
        assert_eq!(result.as_text(), "line one");
    }

    #[test]
    fn test_initialize_result_parsing() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}, "resources": {"subscribe": true}},
            "serverInfo": {"name": "alpha", "version": "1.2.0"}
        }))
        .unwrap();

        assert!(result.capabilities.tools);
        assert!(result.capabilities.resources);
        assert!(!result.capabilities.prompts);
        assert_eq!(result.server_info.name, "alpha");
    }

    #[test]
    fn test_list_page_aliases() {
        let page: ListPage<ResourceInfo> = serde_json::from_value(json!({
            "resources": [{"uri": "file:///a", "name": "a"}],
            "nextCursor": "page-2"
        }))
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_read_resource_text() {
        let result: ReadResourceResult = serde_json::from_value(json!({
            "contents": [{"uri": "file:///a", "mimeType": "text/plain", "text": "hello"}]
        }))
        .unwrap();
        assert_eq!(result.as_text(), "hello");
    }
}
