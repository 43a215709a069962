// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for the bridge hot paths.
//!
//! These benchmarks measure:
//! - Resource cache hits, misses and LRU eviction
//! - Request id issue/resolve in the correlator
//! - JSON-RPC line encoding and decoding
//! - A full tool call over the in-memory transport

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::time::Duration;

use mcp_bridge::cache::{CacheBudget, ResponseCache};
use mcp_bridge::correlator::Correlator;
use mcp_bridge::protocol::{decode, encode, JsonRpcMessage, JsonRpcRequest};
use mcp_bridge::transport::memory::{handshake_result, pair, PeerReply};
use mcp_bridge::{Bridge, Capabilities, ServerConfig};

/// Benchmark cache lookups.
fn bench_cache(c: &mut Criterion) {
    let cache = ResponseCache::new();
    let payload = json!({"contents": [{"uri": "file:///a", "text": "x".repeat(512)}]});
    for i in 0..256 {
        cache.put("alpha", &format!("file:///{}", i), payload.clone(), Duration::from_secs(600));
    }

    c.bench_function("cache_get_hit", |b| {
        b.iter(|| cache.get(black_box("alpha"), black_box("file:///128")));
    });

    c.bench_function("cache_get_miss", |b| {
        b.iter(|| cache.get(black_box("alpha"), black_box("file:///missing")));
    });

    let small = ResponseCache::with_budget(CacheBudget {
        max_entries: 64,
        ..CacheBudget::default()
    });
    let mut n = 0u64;
    c.bench_function("cache_put_with_eviction", |b| {
        b.iter(|| {
            n += 1;
            small.put("alpha", &format!("file:///{}", n), payload.clone(), Duration::from_secs(600));
        });
    });
}

/// Benchmark id allocation and resolution.
fn bench_correlator(c: &mut Criterion) {
    let correlator = Correlator::new("alpha", 64);

    c.bench_function("correlator_issue_resolve", |b| {
        b.iter(|| {
            let issued = correlator.issue(black_box("tools/call")).unwrap();
            correlator.resolve(issued.id, Ok(json!({})));
        });
    });

    c.bench_function("correlator_orphan", |b| {
        b.iter(|| correlator.resolve(black_box(u64::MAX), Ok(json!({}))));
    });
}

/// Benchmark wire framing.
fn bench_framing(c: &mut Criterion) {
    let request: JsonRpcMessage = JsonRpcRequest::new(
        42,
        "tools/call",
        Some(json!({"name": "read_file", "arguments": {"path": "/tmp/file.txt"}})),
    )
    .into();

    c.bench_function("jsonrpc_encode", |b| {
        b.iter(|| encode(black_box(&request)).unwrap());
    });

    let line = r#"{"jsonrpc":"2.0","id":42,"result":{"content":[{"type":"text","text":"hello"}]}}"#;
    c.bench_function("jsonrpc_decode", |b| {
        b.iter(|| decode(black_box(line)).unwrap());
    });
}

/// Benchmark a full tool call: guard, correlator, transport, peer and back.
fn bench_call_tool(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let bridge = rt.block_on(async {
        let bridge = Bridge::default();
        let (conn, peer) = pair("alpha");
        peer.serve(|req| match req.method.as_str() {
            "initialize" => PeerReply::Result(handshake_result("alpha", Capabilities::all())),
            _ => PeerReply::Result(json!({"content": [{"type": "text", "text": "ok"}]})),
        });
        bridge
            .connect_with(ServerConfig::stdio("alpha", "unused"), conn)
            .await
            .unwrap();
        bridge
    });

    c.bench_function("bridge_call_tool_memory", |b| {
        b.to_async(&rt).iter(|| async {
            bridge
                .call_tool("alpha", "echo", black_box(json!({"x": 1})))
                .await
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_cache,
    bench_correlator,
    bench_framing,
    bench_call_tool,
);

criterion_main!(benches);
