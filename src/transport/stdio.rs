// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stdio transport: the server runs as a child process and speaks
//! newline-delimited JSON-RPC on stdin/stdout. Its stderr is forwarded to
//! the log.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{Connection, InboundSender, Transport, TransportEvent};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{decode, encode, JsonRpcMessage};

/// Child-process transport.
pub struct StdioTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the configured command and start the reader tasks.
    pub async fn spawn(config: &ServerConfig) -> Result<Connection> {
        let command = config.command.as_deref().ok_or_else(|| {
            BridgeError::connection_failed(&config.name, "stdio transport requires 'command'")
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);

        for (key, value) in config.resolved_env() {
            cmd.env(key, value);
        }

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::connection_failed(&config.name, e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::connection_failed(&config.name, "Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::connection_failed(&config.name, "Failed to get stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            });
        }

        info!(server = %config.name, command, pid = ?child.id(), "Spawned MCP server");

        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(
            config.name.clone(),
            stdout,
            tx,
            Arc::clone(&connected),
        ));

        let transport = Self {
            server: config.name.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            connected,
        };

        Ok(Connection::new(Arc::new(transport), rx))
    }
}

/// Longest slice of an undecodable line that makes it into the log.
const PREVIEW_CHARS: usize = 200;

fn preview(line: &str) -> String {
    line.chars().take(PREVIEW_CHARS).collect()
}

async fn read_loop<R>(server: String, stdout: R, tx: InboundSender, connected: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break Some("server process exited".to_string()),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode(line) {
                    Ok(message) => {
                        if tx.send(TransportEvent::Message(message)).is_err() {
                            break None;
                        }
                    }
                    Err(e) => {
                        warn!(
                            server = %server,
                            error = %e,
                            line = %preview(line),
                            "Discarding undecodable line"
                        );
                    }
                }
            }
            Err(e) => break Some(format!("read error: {}", e)),
        }
    };

    connected.store(false, Ordering::SeqCst);
    debug!(server = %server, reason = ?reason, "stdout closed");
    let _ = tx.send(TransportEvent::Closed { reason });
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let line = encode(message)?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BridgeError::connection_closed(&self.server))?;

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            BridgeError::transport(&self.server, e.to_string())
        })
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        // Dropping stdin lets well-behaved servers exit on EOF.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.server, error = %e, "kill failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
