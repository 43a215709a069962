// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::cache::CacheBudget;
use crate::correlator::DEFAULT_MAX_OUTSTANDING;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default client name sent in `clientInfo`.
pub const DEFAULT_CLIENT_NAME: &str = "mcp-bridge";

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Map of server name to server configuration.
    #[serde(default, alias = "mcp_servers")]
    pub servers: HashMap<String, ServerConfig>,

    /// Budget of the shared resource cache.
    #[serde(default)]
    pub cache: CacheBudget,

    /// Name reported to servers during the handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            cache: CacheBudget::default(),
            client_name: default_client_name(),
        }
    }
}

impl BridgeConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config.normalized())
    }

    /// Fill every server's `name` from its map key.
    pub fn normalized(mut self) -> Self {
        for (name, server) in self.servers.iter_mut() {
            server.name = name.clone();
        }
        self
    }

    /// Enabled servers, sorted by name.
    pub fn enabled_servers(&self) -> Vec<&ServerConfig> {
        let mut servers: Vec<_> = self.servers.values().filter(|c| c.enabled).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    /// Add a server configuration, naming it.
    pub fn add_server(&mut self, name: impl Into<String>, mut config: ServerConfig) {
        let name = name.into();
        config.name = name.clone();
        self.servers.insert(name, config);
    }

    /// Remove a server configuration.
    pub fn remove_server(&mut self, name: &str) -> Option<ServerConfig> {
        self.servers.remove(name)
    }

    /// Check every server definition and the cache budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::invalid("client_name", "must not be empty"));
        }
        for server in self.servers.values() {
            server.validate()?;
        }
        Ok(())
    }
}

/// Transport type for an MCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Child process speaking newline-delimited JSON over stdio.
    Stdio,

    /// JSON-RPC over HTTP POST.
    Http,
}

impl Default for TransportType {
    fn default() -> Self {
        Self::Stdio
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Per-server resource cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    /// Cap on this server's share of the shared cache.
    pub max_entries: Option<usize>,
}

impl Default for ServerCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 60_000,
            max_entries: None,
        }
    }
}

impl ServerCacheConfig {
    /// Caching turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name; filled from the map key when loaded from a file.
    #[serde(default)]
    pub name: String,

    /// Transport type.
    #[serde(default)]
    pub transport: TransportType,

    /// Whether this server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Handshake window in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-attempt request timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Ceiling on unresolved requests.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding_requests: usize,

    /// Backoff policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Resource cache settings.
    #[serde(default)]
    pub cache: ServerCacheConfig,

    /// List of enabled tools (if empty, all tools are enabled).
    #[serde(default)]
    pub enabled_tools: Vec<String>,

    /// List of disabled tools.
    #[serde(default)]
    pub disabled_tools: Vec<String>,

    /// Environment variables for stdio transport (supports `${VAR}`).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for stdio transport.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Command for stdio transport.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for stdio transport.
    #[serde(default)]
    pub args: Vec<String>,

    /// URL for HTTP transport (supports `${VAR}`).
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for HTTP transport (supports `${VAR}`).
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_max_outstanding() -> usize {
    DEFAULT_MAX_OUTSTANDING
}

impl ServerConfig {
    fn base(name: String, transport: TransportType) -> Self {
        Self {
            name,
            transport,
            enabled: true,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_outstanding_requests: default_max_outstanding(),
            retry: RetryPolicy::default(),
            cache: ServerCacheConfig::default(),
            enabled_tools: Vec::new(),
            disabled_tools: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            command: None,
            args: Vec::new(),
            url: None,
            bearer_token: None,
        }
    }

    /// Create a stdio transport configuration.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::base(name.into(), TransportType::Stdio)
        }
    }

    /// Create an HTTP transport configuration.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::base(name.into(), TransportType::Http)
        }
    }

    /// Add command arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Set environment variables.
    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Set working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set enabled tools.
    pub fn with_enabled_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enabled_tools = tools.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Set disabled tools.
    pub fn with_disabled_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.disabled_tools = tools.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the resource cache settings.
    pub fn with_cache(mut self, cache: ServerCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the handshake window.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the outstanding-request ceiling.
    pub fn with_max_outstanding(mut self, limit: usize) -> Self {
        self.max_outstanding_requests = limit;
        self
    }

    /// Handshake window.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-attempt request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check if a tool is enabled.
    pub fn is_tool_enabled(&self, tool_name: &str) -> bool {
        if self.disabled_tools.iter().any(|t| t == tool_name) {
            return false;
        }
        self.enabled_tools.is_empty() || self.enabled_tools.iter().any(|t| t == tool_name)
    }

    /// Environment with `${VAR}` references expanded.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect()
    }

    /// URL with `${VAR}` references expanded.
    pub fn expanded_url(&self) -> Option<String> {
        self.url.as_deref().map(expand_env)
    }

    /// Bearer token with `${VAR}` references expanded.
    pub fn expanded_bearer_token(&self) -> Option<String> {
        self.bearer_token.as_deref().map(expand_env)
    }

    /// Check transport-specific fields and numeric ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = |f: &str| format!("servers.{}.{}", self.name, f);

        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("servers.<name>".to_string()));
        }

        match self.transport {
            TransportType::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::MissingField(field("command")));
                }
            }
            TransportType::Http => {
                let url = self.url.as_deref().unwrap_or("");
                if url.trim().is_empty() {
                    return Err(ConfigError::MissingField(field("url")));
                }
                if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("${")) {
                    return Err(ConfigError::invalid(field("url"), "must be an http(s) URL"));
                }
            }
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid(field("connect_timeout_ms"), "must be positive"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(field("request_timeout_ms"), "must be positive"));
        }
        if self.max_outstanding_requests == 0 {
            return Err(ConfigError::invalid(
                field("max_outstanding_requests"),
                "must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(field("retry.max_attempts"), "must be at least 1"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                field("retry.backoff_multiplier"),
                "must be >= 1.0",
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                field("retry.initial_delay_ms"),
                "must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Expand `${VAR}` references from the process environment.
///
/// Unset variables expand to the empty string; an unterminated `${` is kept
/// verbatim.
pub fn expand_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                result.push_str(&std::env::var(var_name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
