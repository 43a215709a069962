// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for bridge traffic.
//!
//! Lightweight in-process counters: per-method call counts and latencies,
//! retry counts, cache hit/miss counters and generic timed operations. No
//! exporter; [`Metrics::snapshot`] is the reporting surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Request metrics by JSON-RPC method.
    calls: RwLock<HashMap<String, CallMetrics>>,

    /// Retry counts by method.
    retries: RwLock<HashMap<String, u64>>,

    /// General operation metrics.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            retries: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed request, including all of its attempts.
    pub fn record_call(&self, method: &str, duration: Duration, success: bool) {
        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);
        calls
            .entry(method.to_string())
            .or_insert_with(CallMetrics::new)
            .record(duration, success);
    }

    /// Record one retry of `method`.
    pub fn record_retry(&self, method: &str) {
        let mut retries = self.retries.write().unwrap_or_else(PoisonError::into_inner);
        *retries.entry(method.to_string()).or_insert(0) += 1;
    }

    /// Record a cache lookup.
    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        ops.entry(name.to_string())
            .or_insert_with(OperationMetrics::new)
            .record(duration);
    }

    /// Get metrics for a specific method.
    pub fn call_metrics(&self, method: &str) -> Option<CallMetrics> {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Retries recorded for a method.
    pub fn retry_count(&self, method: &str) -> u64 {
        self.retries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Cache `(hits, misses)`.
    pub fn cache_counts(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (cache_hits, cache_misses) = self.cache_counts();
        MetricsSnapshot {
            calls: self.calls.read().unwrap_or_else(PoisonError::into_inner).clone(),
            retries: self.retries.read().unwrap_or_else(PoisonError::into_inner).clone(),
            operations: self
                .operations
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            cache_hits,
            cache_misses,
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.calls.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.retries.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.operations.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for one JSON-RPC method.
#[derive(Debug, Clone)]
pub struct CallMetrics {
    /// Total number of calls.
    pub calls: u64,

    /// Calls that returned a result.
    pub successes: u64,

    /// Calls that returned an error.
    pub failures: u64,

    /// Total time spent, retries included.
    pub total_duration: Duration,

    pub min_duration: Duration,
    pub max_duration: Duration,

    /// Latency distribution.
    pub histogram: Histogram,
}

impl CallMetrics {
    /// Create new empty call metrics.
    pub fn new() -> Self {
        Self {
            calls: 0,
            successes: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    /// Record one call.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.calls += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    /// Calculate average duration.
    pub fn avg_duration(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.calls as u32
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic timed operation.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,

    /// Count per bucket, plus one overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in microseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration value.
    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let idx = self
            .buckets
            .iter()
            .position(|&b| micros <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Approximate percentile, as the upper bound of the bucket it falls in.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let micros = match self.buckets.get(i) {
                    Some(&bound) => bound,
                    None => self.buckets.last().copied().unwrap_or(0) * 10,
                };
                return Duration::from_micros(micros);
            }
        }

        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // 1ms, 10ms, 100ms, 1s, 10s, 60s
        Self::with_buckets(vec![1_000, 10_000, 100_000, 1_000_000, 10_000_000, 60_000_000])
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub calls: HashMap<String, CallMetrics>,
    pub retries: HashMap<String, u64>,
    pub operations: HashMap<String, OperationMetrics>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Bridge Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Cache: {} hits, {} misses\n\n",
            self.cache_hits, self.cache_misses
        ));

        if !self.calls.is_empty() {
            let mut methods: Vec<_> = self.calls.iter().collect();
            methods.sort_by(|a, b| a.0.cmp(b.0));

            report.push_str("Requests:\n");
            for (method, metrics) in methods {
                report.push_str(&format!(
                    "  {}: {} calls, {:.1}% success, avg {:.2?}, p99 {:.2?}, {} retries\n",
                    method,
                    metrics.calls,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration(),
                    metrics.histogram.p99(),
                    self.retries.get(method).copied().unwrap_or(0)
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operations:\n");
            for (name, metrics) in &self.operations {
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, max {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.max_duration
                ));
            }
        }

        report
    }
}
