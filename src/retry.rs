// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retry with exponential backoff.
//!
//! The controller is a plain loop: run the attempt, and if it failed with a
//! transient error and attempts remain, sleep for the backoff delay and go
//! again. Because the loop is an ordinary future, an outer
//! `tokio::time::timeout` interrupts it between (or during) attempts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Backoff policy for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay.
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the delay ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let raw = self.initial_delay_ms as f64 * multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Each attempt is expected to
    /// issue its own request id.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.attempts();
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(label, attempts = attempt, error = %err, "Retries exhausted");
                if attempt == 1 {
                    return Err(err);
                }
                return Err(BridgeError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            debug!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );

            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_retry(label);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
