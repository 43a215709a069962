// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed publish/subscribe event stream.
//!
//! Every bridge operation emits a requested / success / error triple and every
//! server lifecycle change emits an event. Subscribers are closures invoked
//! synchronously on the emitting task, in emission order, so an observer sees
//! an operation's events before the operation's future completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::session::Capabilities;

/// Event category, used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Server,
    Tool,
    Resource,
    Prompt,
}

/// Which listing an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    fn category(self) -> EventCategory {
        match self {
            Self::Tools => EventCategory::Tool,
            Self::Resources => EventCategory::Resource,
            Self::Prompts => EventCategory::Prompt,
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    ServerConnecting {
        server: String,
    },
    ServerConnected {
        server: String,
        capabilities: Capabilities,
    },
    ServerDisconnected {
        server: String,
    },
    ServerError {
        server: String,
        error: String,
    },

    ToolInvokeRequested {
        server: String,
        tool: String,
        arguments: Value,
    },
    ToolInvoked {
        server: String,
        tool: String,
        is_error: bool,
        duration_ms: u64,
    },
    ToolInvokeError {
        server: String,
        tool: String,
        error: String,
    },

    ResourceReadRequested {
        server: String,
        uri: String,
    },
    ResourceRead {
        server: String,
        uri: String,
        cached: bool,
        duration_ms: u64,
    },
    ResourceReadError {
        server: String,
        uri: String,
        error: String,
    },
    ResourceUpdated {
        server: String,
        uri: String,
    },

    PromptGetRequested {
        server: String,
        prompt: String,
    },
    PromptGot {
        server: String,
        prompt: String,
        duration_ms: u64,
    },
    PromptGetError {
        server: String,
        prompt: String,
        error: String,
    },

    ListRequested {
        server: String,
        list: ListKind,
    },
    Listed {
        server: String,
        list: ListKind,
        count: usize,
    },
    ListError {
        server: String,
        list: ListKind,
        error: String,
    },
}

impl BridgeEvent {
    /// Wire name, e.g. `mcp:tool:invoked`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerConnecting { .. } => "mcp:server:connecting",
            Self::ServerConnected { .. } => "mcp:server:connected",
            Self::ServerDisconnected { .. } => "mcp:server:disconnected",
            Self::ServerError { .. } => "mcp:server:error",
            Self::ToolInvokeRequested { .. } => "mcp:tool:invoke-requested",
            Self::ToolInvoked { .. } => "mcp:tool:invoked",
            Self::ToolInvokeError { .. } => "mcp:tool:invoke:error",
            Self::ResourceReadRequested { .. } => "mcp:resource:read-requested",
            Self::ResourceRead { .. } => "mcp:resource:read",
            Self::ResourceReadError { .. } => "mcp:resource:read:error",
            Self::ResourceUpdated { .. } => "mcp:resource:updated",
            Self::PromptGetRequested { .. } => "mcp:prompt:get-requested",
            Self::PromptGot { .. } => "mcp:prompt:got",
            Self::PromptGetError { .. } => "mcp:prompt:get:error",
            Self::ListRequested { list, .. } => match list {
                ListKind::Tools => "mcp:tools:list-requested",
                ListKind::Resources => "mcp:resources:list-requested",
                ListKind::Prompts => "mcp:prompts:list-requested",
            },
            Self::Listed { list, .. } => match list {
                ListKind::Tools => "mcp:tools:listed",
                ListKind::Resources => "mcp:resources:listed",
                ListKind::Prompts => "mcp:prompts:listed",
            },
            Self::ListError { list, .. } => match list {
                ListKind::Tools => "mcp:tools:list:error",
                ListKind::Resources => "mcp:resources:list:error",
                ListKind::Prompts => "mcp:prompts:list:error",
            },
        }
    }

    /// Category for filtering.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::ServerConnecting { .. }
            | Self::ServerConnected { .. }
            | Self::ServerDisconnected { .. }
            | Self::ServerError { .. } => EventCategory::Server,
            Self::ToolInvokeRequested { .. }
            | Self::ToolInvoked { .. }
            | Self::ToolInvokeError { .. } => EventCategory::Tool,
            Self::ResourceReadRequested { .. }
            | Self::ResourceRead { .. }
            | Self::ResourceReadError { .. }
            | Self::ResourceUpdated { .. } => EventCategory::Resource,
            Self::PromptGetRequested { .. }
            | Self::PromptGot { .. }
            | Self::PromptGetError { .. } => EventCategory::Prompt,
            Self::ListRequested { list, .. }
            | Self::Listed { list, .. }
            | Self::ListError { list, .. } => list.category(),
        }
    }

    /// Server the event concerns.
    pub fn server(&self) -> &str {
        match self {
            Self::ServerConnecting { server }
            | Self::ServerConnected { server, .. }
            | Self::ServerDisconnected { server }
            | Self::ServerError { server, .. }
            | Self::ToolInvokeRequested { server, .. }
            | Self::ToolInvoked { server, .. }
            | Self::ToolInvokeError { server, .. }
            | Self::ResourceReadRequested { server, .. }
            | Self::ResourceRead { server, .. }
            | Self::ResourceReadError { server, .. }
            | Self::ResourceUpdated { server, .. }
            | Self::PromptGetRequested { server, .. }
            | Self::PromptGot { server, .. }
            | Self::PromptGetError { server, .. }
            | Self::ListRequested { server, .. }
            | Self::Listed { server, .. }
            | Self::ListError { server, .. } => server,
        }
    }

    /// Whether this is one of the `:error` events.
    pub fn is_error(&self) -> bool {
        self.name().ends_with(":error")
    }
}

/// An emitted event with its timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: BridgeEvent,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event handler closure.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventCategory>,
    handler: EventHandler,
}

/// Synchronous event bus.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every event.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Receive only events of one category.
    pub fn subscribe_category<F>(&self, category: EventCategory, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(Some(category), Arc::new(handler))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscriber>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscriber>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: Option<EventCategory>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push(Subscriber { id, filter, handler });
        id
    }

    /// Remove a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Deliver an event to every matching subscriber.
    pub fn emit(&self, payload: BridgeEvent) {
        let event = Event {
            name: payload.name(),
            timestamp: Utc::now(),
            payload,
        };
        trace!(event = event.name, server = event.payload.server(), "emit");

        // Snapshot the handlers so a handler may (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = self
            .read()
            .iter()
            .filter(|s| s.filter.map_or(true, |c| c == event.payload.category()))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
