// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in the working
//! directory or the user's home directory.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::{BridgeConfig, ServerConfig};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    "mcp-bridge.json",
    "mcp-bridge.yaml",
    ".mcp-bridge/config.json",
];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".mcp-bridge";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Find the first config file in `dir`, falling back to the global file.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .or_else(|| get_global_config_path().filter(|p| p.exists()))
}

/// Load a configuration file (JSON or YAML by extension).
pub fn load_config_file(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => BridgeConfig::from_yaml(&content),
        _ => BridgeConfig::from_json(&content),
    }
}

/// Save configuration as pretty-printed JSON.
pub fn save_config(path: &Path, config: &BridgeConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Write an example config to `dir/mcp-bridge.json`.
///
/// Fails with `InvalidValue` if the file already exists.
pub fn init_config(dir: &Path) -> Result<PathBuf, ConfigError> {
    let path = dir.join(CONFIG_FILES[0]);
    if path.exists() {
        return Err(ConfigError::invalid(
            "path",
            format!("{} already exists", path.display()),
        ));
    }
    save_config(&path, &get_example_config())?;
    Ok(path)
}

/// An example configuration with one server of each transport.
pub fn get_example_config() -> BridgeConfig {
    let mut config = BridgeConfig::new();
    config.add_server(
        "filesystem",
        ServerConfig::stdio("filesystem", "npx")
            .with_args(["-y", "@modelcontextprotocol/server-filesystem", "."]),
    );
    let mut remote = ServerConfig::http("remote", "https://mcp.example.com/v1")
        .with_bearer_token("${REMOTE_MCP_TOKEN}");
    remote.enabled = false;
    config.add_server("remote", remote);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES[0], "mcp-bridge.json");
        assert_eq!(CONFIG_FILES[1], "mcp-bridge.yaml");
    }

    #[test]
    fn test_global_config_dir() {
        if let Some(dir) = get_global_config_dir() {
            assert!(dir.ends_with(".mcp-bridge"));
        }
    }

    #[test]
    fn test_load_json_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mcp-bridge.json");
        std::fs::write(&path, r#"{"servers": {"alpha": {"command": "srv"}}}"#).unwrap();

        assert_eq!(find_config_file(temp.path()), Some(path.clone()));
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.servers["alpha"].name, "alpha");
    }

    #[test]
    fn test_load_yaml_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mcp-bridge.yaml");
        std::fs::write(&path, "servers:\n  beta:\n    transport: http\n    url: http://localhost:1\n")
            .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.servers["beta"].url.as_deref(), Some("http://localhost:1"));
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = load_config_file(&temp.path().join("nope.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mcp-bridge.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_init_config() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path()).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
        config.validate().unwrap();

        assert!(init_config(temp.path()).is_err());
    }
}
