// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request correlation.
//!
//! The correlator hands out request ids for one session and matches responses
//! back to the waiting caller. Issuing an id and recording its pending entry
//! happen under a single lock, so concurrent callers never share an id and the
//! outstanding ceiling cannot be overshot.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Outcome delivered to a waiting caller.
pub type Reply = Result<Value>;

/// Default ceiling on unresolved requests per session.
pub const DEFAULT_MAX_OUTSTANDING: usize = 64;

struct PendingRequest {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Reply>,
}

struct CorrelatorState {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    closed: bool,
}

/// An id handed to a caller together with the receiver for its reply.
#[derive(Debug)]
pub struct IssuedRequest {
    pub id: u64,
    pub receiver: oneshot::Receiver<Reply>,
}

/// Per-session id allocator and pending-request table.
pub struct Correlator {
    server: String,
    max_outstanding: usize,
    state: Mutex<CorrelatorState>,
}

impl Correlator {
    /// Create a correlator whose first id is 1.
    pub fn new(server: impl Into<String>, max_outstanding: usize) -> Self {
        Self {
            server: server.into(),
            max_outstanding: max_outstanding.max(1),
            state: Mutex::new(CorrelatorState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and record a pending entry for it.
    pub fn issue(&self, method: &str) -> Result<IssuedRequest> {
        let mut state = self.lock();

        if state.closed {
            return Err(BridgeError::connection_closed(&self.server));
        }

        if state.pending.len() >= self.max_outstanding {
            warn!(
                server = %self.server,
                method,
                limit = self.max_outstanding,
                "Rejecting request: outstanding ceiling reached"
            );
            return Err(BridgeError::TooManyOutstandingRequests {
                server: self.server.clone(),
                limit: self.max_outstanding,
            });
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );

        debug!(server = %self.server, id, method, "Issued request");
        Ok(IssuedRequest { id, receiver })
    }

    /// Deliver a reply to the caller waiting on `id`.
    ///
    /// Returns `false` when no such request is outstanding; the reply is then
    /// an orphan and is dropped.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        let entry = self.lock().pending.remove(&id);

        match entry {
            Some(pending) => {
                debug!(
                    server = %self.server,
                    id,
                    method = %pending.method,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "Resolved request"
                );
                // The caller may have given up in the meantime.
                let _ = pending.tx.send(reply);
                true
            }
            None => {
                warn!(server = %self.server, id, "Discarding orphan response");
                false
            }
        }
    }

    /// Forget a pending request without replying to it.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Close the correlator and fail every pending request with
    /// `ConnectionClosed`. Later `issue` calls fail the same way.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().collect()
        };

        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(BridgeError::connection_closed(&self.server)));
        }

        if count > 0 {
            debug!(server = %self.server, count, "Failed pending requests");
        }
        count
    }

    /// Number of unresolved requests.
    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    /// The id the next `issue` will return.
    pub fn next_id(&self) -> u64 {
        self.lock().next_id
    }

    /// Whether `id` is still waiting for a reply.
    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Whether `fail_all` has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Configured outstanding ceiling.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }
}

/// Removes a pending entry when the waiting caller goes away, whether it
/// finished, timed out or was dropped mid-await.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(correlator: &'a Correlator, id: u64) -> Self {
        Self { correlator, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.id);
    }
}
