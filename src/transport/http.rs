// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport.
//!
//! Every outbound message is POSTed to the server URL. Replies come back in
//! the response body, either as JSON (one object or a batch array) or as an
//! event stream of `data:` lines, and are pushed onto the inbound channel so
//! the client sees them exactly as it would on stdio. The `Mcp-Session-Id`
//! header assigned by the server is replayed on later requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Connection, InboundSender, Transport, TransportEvent};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::JsonRpcMessage;

/// Session header (`Mcp-Session-Id`) assigned by streamable-HTTP servers.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST.
pub struct HttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
    session_id: Mutex<Option<String>>,
    inbound: InboundSender,
    connected: AtomicBool,
}

impl HttpTransport {
    /// Build the transport. No request is made until the first send.
    pub fn connect(config: &ServerConfig) -> Result<Connection> {
        let url = config
            .expanded_url()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BridgeError::connection_failed(&config.name, "http transport requires 'url'"))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BridgeError::connection_failed(&config.name, e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            server: config.name.clone(),
            url,
            client,
            bearer_token: config.expanded_bearer_token().filter(|t| !t.is_empty()),
            session_id: Mutex::new(None),
            inbound: tx,
            connected: AtomicBool::new(true),
        };

        Ok(Connection::new(Arc::new(transport), rx))
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        if let Some(token) = &self.bearer_token {
            let value = if token.starts_with("Bearer ") {
                token.clone()
            } else {
                format!("Bearer {}", token)
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        let session = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            if let Ok(value) = HeaderValue::from_str(&session) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    fn remember_session(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut slot = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_deref() != Some(id) {
                debug!(server = %self.server, session = id, "HTTP session assigned");
                *slot = Some(id.to_string());
            }
        }
    }

    fn deliver(&self, value: Value) -> Result<()> {
        for message in JsonRpcMessage::batch_from_value(value)? {
            if self.inbound.send(TransportEvent::Message(message)).is_err() {
                return Err(BridgeError::connection_closed(&self.server));
            }
        }
        Ok(())
    }
}

/// Extract the JSON payloads from an event-stream body.
pub(crate) fn parse_event_stream(body: &str) -> Vec<Value> {
    fn flush(data: &mut String, values: &mut Vec<Value>) {
        if !data.is_empty() {
            match serde_json::from_str(data) {
                Ok(value) => values.push(value),
                Err(e) => warn!(error = %e, "Discarding undecodable event"),
            }
            data.clear();
        }
    }

    let mut values = Vec::new();
    let mut data = String::new();

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.trim().is_empty() {
            flush(&mut data, &mut values);
        }
    }
    flush(&mut data, &mut values);
    values
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::connection_closed(&self.server));
        }

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers())
            .json(message)
            .send()
            .await
            .map_err(|e| BridgeError::transport(&self.server, e.to_string()))?;

        self.remember_session(response.headers());

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BridgeError::transport(
                &self.server,
                format!("HTTP {}", status),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::connection_failed(
                &self.server,
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::transport(&self.server, e.to_string()))?;

        if body.trim().is_empty() {
            // 202 Accepted for notifications and responses.
            return Ok(());
        }

        if is_stream {
            for value in parse_event_stream(&body) {
                self.deliver(value)?;
            }
            Ok(())
        } else {
            let value: Value = serde_json::from_str(&body)
                .map_err(|e| BridgeError::InvalidResponse(format!("HTTP body: {}", e)))?;
            self.deliver(value)
        }
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(TransportEvent::Closed { reason: None });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
