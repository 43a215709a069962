// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and metrics.
//!
//! - **Logging**: `tracing` macros throughout the crate; [`init_telemetry`]
//!   installs an `EnvFilter` + fmt subscriber writing to stderr.
//! - **Metrics**: [`GLOBAL_METRICS`] counts requests, retries and cache
//!   lookups. Recording is compiled in only with the `telemetry` feature.
//!
//! ```rust,ignore
//! use mcp_bridge::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::verbose())?;
//! ```

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig};
pub use metrics::{CallMetrics, Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS};
