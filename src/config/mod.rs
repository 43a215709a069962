// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the MCP bridge.
//!
//! Configuration is read from the first file found among:
//! - `mcp-bridge.json`, `mcp-bridge.yaml`, `.mcp-bridge/config.json` in the
//!   working directory
//! - the global `~/.mcp-bridge/config.json`
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "servers": {
//!     "filesystem": {
//!       "transport": "stdio",
//!       "command": "npx",
//!       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/path"],
//!       "request_timeout_ms": 30000,
//!       "retry": {"max_attempts": 3, "initial_delay_ms": 100}
//!     },
//!     "github": {
//!       "transport": "http",
//!       "url": "https://mcp.github.com/v1",
//!       "bearer_token": "${GITHUB_TOKEN}",
//!       "enabled_tools": ["get_issue", "create_pr"]
//!     }
//!   }
//! }
//! ```

mod loader;
mod types;

pub use loader::{
    find_config_file, get_example_config, get_global_config_dir, get_global_config_path,
    init_config, load_config_file, save_config, CONFIG_FILES, GLOBAL_CONFIG_DIR,
    GLOBAL_CONFIG_FILE,
};

pub use types::{
    expand_env, BridgeConfig, ServerCacheConfig, ServerConfig, TransportType,
    DEFAULT_CLIENT_NAME,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and validate configuration.
///
/// An explicit path must exist. Without one, the search order in
/// [`CONFIG_FILES`] is applied to `dir`; no file at all yields an empty
/// configuration.
pub fn load_config(dir: &Path, explicit: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let config = match explicit {
        Some(path) => load_config_file(path)?,
        None => match find_config_file(dir) {
            Some(path) => load_config_file(&path)?,
            None => BridgeConfig::default(),
        },
    };
    config.validate()?;
    Ok(config)
}
