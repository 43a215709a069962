// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle state machine.
//!
//! One [`Session`] exists per client/server pairing. It only moves forward:
//!
//! ```text
//! Uninitialized ──► Initializing ──► Initialized ──► Operating
//!       │                 │                │              │
//!       └─────────────────┴────────────────┴──────────────┴──► Shutdown
//! ```
//!
//! Capabilities are recorded when the handshake response arrives and are
//! consulted by [`Session::ensure_ready`] before every dispatch.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BridgeError, Result};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No handshake attempted yet.
    Uninitialized,

    /// `initialize` request sent, waiting for the server.
    Initializing,

    /// Handshake response received, acknowledgment not yet sent.
    Initialized,

    /// Fully negotiated, accepting calls.
    Operating,

    /// Terminal.
    Shutdown,
}

impl SessionState {
    /// Whether the handshake has started.
    pub fn has_started(self) -> bool {
        self != Self::Uninitialized
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Shutdown
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Initialized => write!(f, "initialized"),
            Self::Operating => write!(f, "operating"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A category of operation a server may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Tools,
    Resources,
    Prompts,
    Sampling,
}

impl Capability {
    /// The capability a JSON-RPC method requires, if any.
    pub fn required_by(method: &str) -> Option<Self> {
        let prefix = method.split('/').next().unwrap_or(method);
        match prefix {
            "tools" => Some(Self::Tools),
            "resources" => Some(Self::Resources),
            "prompts" => Some(Self::Prompts),
            "sampling" => Some(Self::Sampling),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tools => write!(f, "tools"),
            Self::Resources => write!(f, "resources"),
            Self::Prompts => write!(f, "prompts"),
            Self::Sampling => write!(f, "sampling"),
        }
    }
}

/// Negotiated capability set.
///
/// Servers advertise capabilities either as booleans or as objects
/// (`"tools": {"listChanged": true}`); any non-null, non-false value counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, deserialize_with = "advertised")]
    pub tools: bool,

    #[serde(default, deserialize_with = "advertised")]
    pub resources: bool,

    #[serde(default, deserialize_with = "advertised")]
    pub prompts: bool,

    #[serde(default, deserialize_with = "advertised")]
    pub sampling: bool,
}

fn advertised<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => b,
        _ => true,
    })
}

impl Capabilities {
    /// Every capability enabled.
    pub fn all() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
            sampling: true,
        }
    }

    /// Check a single capability flag.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Tools => self.tools,
            Capability::Resources => self.resources,
            Capability::Prompts => self.prompts,
            Capability::Sampling => self.sampling,
        }
    }

    /// Builder-style toggle, mostly for tests and fake servers.
    pub fn with(mut self, capability: Capability, enabled: bool) -> Self {
        match capability {
            Capability::Tools => self.tools = enabled,
            Capability::Resources => self.resources = enabled,
            Capability::Prompts => self.prompts = enabled,
            Capability::Sampling => self.sampling = enabled,
        }
        self
    }
}

/// Lifecycle and negotiated state for one client/server pairing.
#[derive(Debug, Clone)]
pub struct Session {
    server: String,
    state: SessionState,
    capabilities: Capabilities,
}

impl Session {
    /// Create a session in the `Uninitialized` state.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            state: SessionState::Uninitialized,
            capabilities: Capabilities::default(),
        }
    }

    /// Server name this session belongs to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated capabilities. All false until the handshake completes.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// `Uninitialized → Initializing`.
    pub fn begin_handshake(&mut self) -> Result<()> {
        self.transition(SessionState::Uninitialized, SessionState::Initializing)
    }

    /// `Initializing → Initialized`, recording the advertised capabilities.
    pub fn complete_handshake(&mut self, capabilities: Capabilities) -> Result<()> {
        self.transition(SessionState::Initializing, SessionState::Initialized)?;
        self.capabilities = capabilities;
        Ok(())
    }

    /// `Initialized → Operating`, after the `initialized` notification went out.
    pub fn mark_operating(&mut self) -> Result<()> {
        self.transition(SessionState::Initialized, SessionState::Operating)
    }

    /// Move to `Shutdown`. Returns `false` if the session was already shut down.
    pub fn shutdown(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        tracing::debug!(server = %self.server, from = %self.state, "session shutdown");
        self.state = SessionState::Shutdown;
        true
    }

    /// Guard evaluated before every dispatch.
    pub fn ensure_ready(&self, capability: Option<Capability>) -> Result<()> {
        if self.state != SessionState::Operating {
            return Err(BridgeError::InvalidSessionState {
                server: self.server.clone(),
                state: self.state,
            });
        }

        match capability {
            Some(cap) if !self.capabilities.has(cap) => Err(BridgeError::CapabilityNotNegotiated {
                server: self.server.clone(),
                capability: cap,
            }),
            _ => Ok(()),
        }
    }

    /// Guard for a JSON-RPC method name.
    pub fn ensure_method_allowed(&self, method: &str) -> Result<()> {
        self.ensure_ready(Capability::required_by(method))
    }

    fn transition(&mut self, from: SessionState, to: SessionState) -> Result<()> {
        if self.state != from {
            return Err(BridgeError::InvalidSessionState {
                server: self.server.clone(),
                state: self.state,
            });
        }
        tracing::trace!(server = %self.server, %from, %to, "session transition");
        self.state = to;
        Ok(())
    }
}
