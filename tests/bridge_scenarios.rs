// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios driven through the public bridge API against a
//! scripted in-memory server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::Instant;

use mcp_bridge::config::load_config;
use mcp_bridge::protocol::JsonRpcMessage;
use mcp_bridge::transport::memory::{handshake_result, pair, PeerHandle, PeerReply};
use mcp_bridge::{
    Bridge, BridgeConfig, BridgeError, CallOptions, Capabilities, Capability, RetryPolicy,
    ServerCacheConfig, ServerConfig, ServerStatus, SessionState,
};

fn server(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, "unused").with_connect_timeout(Duration::from_secs(5))
}

fn tools_only() -> Capabilities {
    Capabilities::default().with(Capability::Tools, true)
}

/// Connect `config` to a peer that answers every request through `reply`.
async fn connect_scripted<F>(bridge: &Bridge, config: ServerConfig, caps: Capabilities, mut reply: F) -> PeerHandle
where
    F: FnMut(&str, &Value) -> PeerReply + Send + 'static,
{
    let (conn, peer) = pair(config.name.clone());
    let handle = peer.handle();
    let name = config.name.clone();
    peer.serve(move |req| {
        if req.method == "initialize" {
            return PeerReply::Result(handshake_result(&name, caps));
        }
        reply(&req.method, req.params.as_ref().unwrap_or(&Value::Null))
    });
    bridge.connect_with(config, conn).await.unwrap();
    handle
}

fn record_events(bridge: &Bridge) -> Arc<Mutex<Vec<&'static str>>> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    bridge.events().subscribe(move |e| sink.lock().unwrap().push(e.name));
    names
}

fn count_method(peer: &PeerHandle, method: &str) -> usize {
    peer.received_methods().iter().filter(|m| *m == method).count()
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let bridge = Bridge::default();
    let events = record_events(&bridge);
    let (conn, _silent_peer) = pair("alpha");

    let config = server("alpha")
        .with_retry(RetryPolicy::none())
        .with_connect_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let err = bridge.connect_with(config, conn).await.unwrap_err();

    assert!(matches!(err, BridgeError::ConnectionTimeout { timeout_ms: 50, .. }));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(bridge.status("alpha"), Some(ServerStatus::Error));

    let client = bridge.manager().client("alpha").unwrap();
    assert_eq!(client.state(), SessionState::Shutdown);
    assert_eq!(client.outstanding(), 0);

    assert_eq!(
        *events.lock().unwrap(),
        vec!["mcp:server:connecting", "mcp:server:error"]
    );
}

#[tokio::test]
async fn test_capability_gating() {
    let bridge = Bridge::default();
    let peer = connect_scripted(&bridge, server("alpha"), tools_only(), |method, _| match method {
        "tools/call" => PeerReply::Result(json!({"content": [{"type": "text", "text": "ok"}]})),
        _ => PeerReply::Result(json!({})),
    })
    .await;
    let events = record_events(&bridge);

    let err = bridge.read_resource("alpha", "file:///x").await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::CapabilityNotNegotiated { capability: Capability::Resources, .. }
    ));
    assert_eq!(count_method(&peer, "resources/read"), 0);

    let result = bridge.call_tool("alpha", "echo", json!({})).await.unwrap();
    assert_eq!(result.as_text(), "ok");

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "mcp:resource:read-requested",
            "mcp:resource:read:error",
            "mcp:tool:invoke-requested",
            "mcp:tool:invoked",
        ]
    );
}

#[tokio::test]
async fn test_concurrent_calls_correlate_out_of_order() {
    let bridge = Bridge::default();
    let (conn, mut peer) = pair("alpha");

    let handshake = async {
        let req = peer.recv_request().await.unwrap();
        peer.respond(req.id, handshake_result("alpha", tools_only()));
    };
    let (connected, _) = tokio::join!(bridge.connect_with(server("alpha"), conn), handshake);
    connected.unwrap();

    let reverse_server = async {
        let mut requests = Vec::new();
        while requests.len() < 3 {
            requests.push(peer.recv_request().await.unwrap());
        }
        let ids: Vec<u64> = requests.iter().filter_map(|r| r.numeric_id()).collect();

        for req in requests.iter().rev() {
            let n = &req.params.as_ref().unwrap()["arguments"]["n"];
            peer.respond(
                req.id.clone(),
                json!({"content": [{"type": "text", "text": format!("n={}", n)}]}),
            );
        }
        ids
    };

    let (one, two, three, ids) = tokio::join!(
        bridge.call_tool("alpha", "echo", json!({"n": 1})),
        bridge.call_tool("alpha", "echo", json!({"n": 2})),
        bridge.call_tool("alpha", "echo", json!({"n": 3})),
        reverse_server,
    );

    assert_eq!(one.unwrap().as_text(), "n=1");
    assert_eq!(two.unwrap().as_text(), "n=2");
    assert_eq!(three.unwrap().as_text(), "n=3");

    // `initialize` took id 1; the calls got the next three, in issue order.
    assert_eq!(ids, vec![2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff() {
    let bridge = Bridge::default();
    let retry = RetryPolicy::default()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(100))
        .with_multiplier(2.0);

    let peer = connect_scripted(&bridge, server("alpha").with_retry(retry), tools_only(), |_, _| {
        PeerReply::Result(json!({"content": [{"type": "text", "text": "done"}]}))
    })
    .await;

    let before = peer.send_attempts();
    let next_id = bridge.manager().client("alpha").unwrap().next_request_id();
    peer.fail_next_sends(2);

    let started = Instant::now();
    let result = bridge.call_tool("alpha", "flaky", json!({})).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.as_text(), "done");
    assert_eq!(peer.send_attempts() - before, 3);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "elapsed {:?}", elapsed);

    // Every attempt took a fresh id.
    let client = bridge.manager().client("alpha").unwrap();
    assert_eq!(client.next_request_id(), next_id + 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let bridge = Bridge::default();
    let retry = RetryPolicy::default().with_initial_delay(Duration::from_millis(10));
    let peer = connect_scripted(&bridge, server("alpha").with_retry(retry), tools_only(), |_, _| {
        PeerReply::Result(json!({}))
    })
    .await;
    let events = record_events(&bridge);

    peer.fail_next_sends(5);
    let err = bridge.call_tool("alpha", "flaky", json!({})).await.unwrap_err();

    assert!(matches!(err, BridgeError::RetriesExhausted { attempts: 3, .. }));
    assert!(matches!(err.root(), BridgeError::Transport { .. }));
    assert_eq!(
        *events.lock().unwrap(),
        vec!["mcp:tool:invoke-requested", "mcp:tool:invoke:error"]
    );
}

#[tokio::test]
async fn test_application_error_not_retried() {
    let bridge = Bridge::default();
    let peer = connect_scripted(&bridge, server("alpha"), tools_only(), |_, _| {
        PeerReply::Error(mcp_bridge::protocol::JsonRpcError::new(-32000, "quota exceeded"))
    })
    .await;

    let err = bridge.call_tool("alpha", "send", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::ToolExecution { .. }));
    assert_eq!(count_method(&peer, "tools/call"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl_expiry() {
    let bridge = Bridge::default();
    let cache = ServerCacheConfig {
        enabled: true,
        ttl_ms: 50,
        max_entries: None,
    };
    let peer = connect_scripted(
        &bridge,
        server("serverX").with_cache(cache),
        Capabilities::all(),
        |_, params| {
            let uri = params["uri"].as_str().unwrap_or_default().to_string();
            PeerReply::Result(json!({"contents": [{"uri": uri, "text": "body"}]}))
        },
    )
    .await;

    let cached_flags = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cached_flags);
    bridge.events().subscribe(move |e| {
        if let mcp_bridge::BridgeEvent::ResourceRead { cached, .. } = &e.payload {
            sink.lock().unwrap().push(*cached);
        }
    });

    bridge.read_resource("serverX", "uri1").await.unwrap();
    assert_eq!(count_method(&peer, "resources/read"), 1);

    bridge.read_resource("serverX", "uri1").await.unwrap();
    assert_eq!(count_method(&peer, "resources/read"), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;

    let result = bridge.read_resource("serverX", "uri1").await.unwrap();
    assert_eq!(result.as_text(), "body");
    assert_eq!(count_method(&peer, "resources/read"), 2);
    assert!(bridge.cache().contains("serverX", "uri1"));

    assert_eq!(*cached_flags.lock().unwrap(), vec![false, true, false]);
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let bridge = Bridge::default();
    connect_scripted(&bridge, server("alpha"), tools_only(), |method, _| match method {
        "tools/call" => PeerReply::Ignore,
        _ => PeerReply::Result(json!({})),
    })
    .await;
    let client = bridge.manager().client("alpha").unwrap();

    let (first, second, _) = tokio::join!(
        bridge.call_tool("alpha", "slow", json!({})),
        bridge.call_tool("alpha", "slow", json!({})),
        async {
            while client.outstanding() < 2 {
                tokio::task::yield_now().await;
            }
            bridge.disconnect("alpha").await.unwrap();
        },
    );

    assert!(matches!(first, Err(BridgeError::ConnectionClosed { .. })));
    assert!(matches!(second, Err(BridgeError::ConnectionClosed { .. })));
    assert_eq!(client.outstanding(), 0);

    let third = bridge.call_tool("alpha", "slow", json!({})).await;
    assert!(matches!(
        third,
        Err(BridgeError::InvalidSessionState { state: SessionState::Shutdown, .. })
    ));
    assert_eq!(bridge.status("alpha"), Some(ServerStatus::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_keeps_pending_calls() {
    let bridge = Bridge::default();
    let config = server("alpha")
        .with_max_outstanding(1)
        .with_retry(RetryPolicy::none())
        .with_request_timeout(Duration::from_millis(200));
    let peer = connect_scripted(&bridge, config, tools_only(), |_, _| PeerReply::Ignore).await;
    let client = bridge.manager().client("alpha").unwrap();

    let (first, second) = tokio::join!(bridge.call_tool("alpha", "slow", json!({})), async {
        while client.outstanding() < 1 {
            tokio::task::yield_now().await;
        }
        bridge.call_tool("alpha", "slow", json!({})).await
    });

    assert!(matches!(
        second,
        Err(BridgeError::TooManyOutstandingRequests { limit: 1, .. })
    ));
    // The pending call was untouched and ran into its own timeout.
    assert!(matches!(first, Err(BridgeError::Timeout { .. })));
    assert_eq!(count_method(&peer, "tools/call"), 1);
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_orphan_response_discarded() {
    let bridge = Bridge::default();
    let (conn, mut peer) = pair("alpha");
    let handshake = async {
        let req = peer.recv_request().await.unwrap();
        peer.respond(req.id, handshake_result("alpha", tools_only()));
    };
    let (connected, _) = tokio::join!(bridge.connect_with(server("alpha"), conn), handshake);
    connected.unwrap();

    let server_side = async {
        let req = peer.recv_request().await.unwrap();
        // Unknown id first, then the real answer.
        peer.respond(999, json!({"content": [{"type": "text", "text": "stray"}]}));
        peer.respond(req.id, json!({"content": [{"type": "text", "text": "mine"}]}));
    };
    let (result, _) = tokio::join!(bridge.call_tool("alpha", "echo", json!({})), server_side);

    assert_eq!(result.unwrap().as_text(), "mine");
    assert_eq!(bridge.status("alpha"), Some(ServerStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_late_response_is_dropped() {
    let bridge = Bridge::default();
    let (conn, mut peer) = pair("alpha");
    let handshake = async {
        let req = peer.recv_request().await.unwrap();
        peer.respond(req.id, handshake_result("alpha", tools_only()));
    };
    let (connected, _) = tokio::join!(bridge.connect_with(server("alpha"), conn), handshake);
    connected.unwrap();
    let client = bridge.manager().client("alpha").unwrap();
    let events = record_events(&bridge);

    let options = CallOptions::new()
        .with_timeout(Duration::from_millis(100))
        .with_retry(RetryPolicy::none());
    let server_side = async {
        let req = peer.recv_request().await.unwrap();
        let notice = peer.recv().await.unwrap();
        (req, notice)
    };
    let (outcome, (req, notice)) = tokio::join!(
        bridge.call_tool_with("alpha", "slow", json!({}), &options),
        server_side
    );

    assert!(matches!(outcome, Err(BridgeError::Timeout { timeout_ms: 100, .. })));
    assert_eq!(req.numeric_id(), Some(2));
    match notice {
        JsonRpcMessage::Notification(n) => {
            assert_eq!(n.method, "notifications/cancelled");
            assert_eq!(n.params.unwrap()["requestId"], 2);
        }
        other => panic!("expected cancel notice, got {:?}", other),
    }
    assert_eq!(client.outstanding(), 0);

    // The answer shows up after the caller gave up.
    peer.respond(req.id, json!({"content": [{"type": "text", "text": "late"}]}));

    let server_side = async {
        let req = peer.recv_request().await.unwrap();
        assert_eq!(req.numeric_id(), Some(3));
        peer.respond(req.id, json!({"content": [{"type": "text", "text": "fresh"}]}));
    };
    let (result, _) = tokio::join!(bridge.call_tool("alpha", "echo", json!({})), server_side);

    assert_eq!(result.unwrap().as_text(), "fresh");
    assert_eq!(bridge.status("alpha"), Some(ServerStatus::Connected));
    assert_eq!(client.state(), SessionState::Operating);
    assert_eq!(client.outstanding(), 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "mcp:tool:invoke-requested",
            "mcp:tool:invoke:error",
            "mcp:tool:invoke-requested",
            "mcp:tool:invoked",
        ]
    );
}

#[tokio::test]
async fn test_resource_update_fan_out() {
    let bridge = Bridge::default();
    let peer = connect_scripted(&bridge, server("alpha"), Capabilities::all(), |method, params| {
        match method {
            "resources/read" => PeerReply::Result(json!({
                "contents": [{"uri": params["uri"], "text": "v1"}]
            })),
            _ => PeerReply::Result(json!({})),
        }
    })
    .await;

    bridge.read_resource("alpha", "file:///a").await.unwrap();
    bridge.read_resource("alpha", "file:///b").await.unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    for (uri, tag) in [("file:///a", "a1"), ("file:///a", "a2"), ("file:///b", "b1")] {
        let updates = Arc::clone(&updates);
        bridge
            .subscribe_to_resource("alpha", uri, move |update| {
                updates.lock().unwrap().push(format!("{}:{}", tag, update.uri));
            })
            .await
            .unwrap();
    }
    assert_eq!(count_method(&peer, "resources/subscribe"), 2);

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    bridge.events().subscribe(move |e| {
        if e.name == "mcp:resource:updated" {
            sink.lock().unwrap().push(e.payload.server().to_string());
        }
    });

    peer.notify("notifications/resources/updated", Some(json!({"uri": "file:///a"})));
    while order.lock().unwrap().is_empty() {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        *updates.lock().unwrap(),
        vec!["a1:file:///a", "a2:file:///a"]
    );
    assert!(!bridge.cache().contains("alpha", "file:///a"));
    assert!(bridge.cache().contains("alpha", "file:///b"));
    assert_eq!(*order.lock().unwrap(), vec!["alpha"]);
}

#[tokio::test]
async fn test_transport_loss_and_manual_reconnect() {
    let bridge = Bridge::default();
    let peer = connect_scripted(&bridge, server("alpha"), tools_only(), |_, _| {
        PeerReply::Result(json!({}))
    })
    .await;
    let events = record_events(&bridge);

    peer.disconnect();
    while bridge.status("alpha") != Some(ServerStatus::Error) {
        tokio::task::yield_now().await;
    }
    assert_eq!(*events.lock().unwrap(), vec!["mcp:server:error"]);

    let err = bridge.call_tool("alpha", "echo", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidSessionState { .. }));

    connect_scripted(&bridge, server("alpha"), tools_only(), |_, _| {
        PeerReply::Result(json!({"content": []}))
    })
    .await;
    assert_eq!(bridge.status("alpha"), Some(ServerStatus::Connected));
    assert!(bridge.call_tool("alpha", "echo", json!({})).await.is_ok());
}

#[tokio::test]
async fn test_partial_availability_from_config_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("mcp-bridge.json"),
        r#"{
            "servers": {
                "broken": {"transport": "stdio", "command": "/nonexistent/mcp-server"},
                "off": {"transport": "stdio", "command": "true", "enabled": false}
            },
            "client_name": "scenario-tests"
        }"#,
    )
    .unwrap();

    let config: BridgeConfig = load_config(temp.path(), None).unwrap();
    assert_eq!(config.client_name, "scenario-tests");

    let bridge = Bridge::new(&config);
    connect_scripted(&bridge, server("healthy"), tools_only(), |_, _| {
        PeerReply::Result(json!({"content": []}))
    })
    .await;

    let results = bridge.connect_configured().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "broken");
    assert!(results[0].1.is_err());

    assert_eq!(bridge.status("broken"), Some(ServerStatus::Error));
    assert_eq!(bridge.status("healthy"), Some(ServerStatus::Connected));
    assert!(bridge.status("off").is_none());
    assert!(bridge.call_tool("healthy", "echo", json!({})).await.is_ok());

    bridge.shutdown().await;
    assert_eq!(bridge.status("healthy"), Some(ServerStatus::Disconnected));
}
