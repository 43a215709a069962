// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging initialization.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use std::io;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include target module path.
    pub include_target: bool,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,

    /// Whether to use compact log format.
    pub compact: bool,

    /// Custom filter directive (overrides default_level and RUST_LOG).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            include_file_line: false,
            include_target: false,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Lifecycle events at info level (`-v`).
    pub fn verbose() -> Self {
        Self {
            default_level: Level::INFO,
            include_target: true,
            ..Self::default()
        }
    }

    /// Full traffic logging (`--debug`).
    pub fn debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_file_line: true,
            include_target: true,
            compact: false,
            ..Self::default()
        }
    }

    /// Trace-level output for tests.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            include_file_line: true,
            include_target: true,
            ansi_colors: false,
            compact: false,
            filter_directive: Some("mcp_bridge=trace".to_string()),
        }
    }

    /// Set the default log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Build the filter: explicit directive, else `RUST_LOG`, else the level.
    pub fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line);

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let result = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };

    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
