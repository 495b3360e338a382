//! Connection registry and broadcast relay.
//!
//! `ConnectionManager` owns every live connection, keyed by a process-unique
//! id. All reads and mutations go through a single mutex, and no operation
//! awaits while holding it, so a broadcast pass always runs to completion
//! before another connection can be inserted or removed.

use crate::protocol::{self, Command, ParseResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send one text frame, verbatim.
    Text(String),
    /// Start a graceful WebSocket close.
    Close,
}

/// Error returned when a peer's writer task has gone away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("peer transport is closed")]
pub struct PeerClosed;

/// Handle to an open transport.
///
/// The transport counts as open while its writer task still holds the
/// receiving half of the channel. The channel is unbounded: a peer that
/// stops reading keeps queueing frames until its socket fails.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerHandle {
    /// Create a handle and the receiver its writer task should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame. Never blocks.
    pub fn send(&self, payload: &str) -> Result<(), PeerClosed> {
        self.tx
            .send(Outbound::Text(payload.to_owned()))
            .map_err(|_| PeerClosed)
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) -> Result<(), PeerClosed> {
        self.tx.send(Outbound::Close).map_err(|_| PeerClosed)
    }
}

/// Delivery counts for one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub success: usize,
    pub failure: usize,
}

/// What `on_message` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The frame was a `sendmessage` envelope and was fanned out.
    Broadcast(BroadcastReport),
    /// The frame could not be decoded.
    Malformed,
    /// The frame decoded but did not name a known action with a payload.
    Ignored,
}

struct Registry {
    next_id: u64,
    peers: HashMap<u64, PeerHandle>,
    shutting_down: bool,
}

/// Owner of the live connection set.
pub struct ConnectionManager {
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    /// Create an empty manager. Ids start at 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                peers: HashMap::new(),
                shutting_down: false,
            }),
        })
    }

    // Every step leaves the map consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a newly accepted transport and return its id.
    ///
    /// Once `shutdown` has run, the transport is still registered but is
    /// asked to close straight away.
    pub fn accept(&self, peer: PeerHandle) -> u64 {
        let mut registry = self.lock();
        let conn_id = registry.next_id;
        registry.next_id += 1;
        let shutting_down = registry.shutting_down;
        if shutting_down {
            if let Err(e) = peer.close() {
                trace!(conn_id, error = %e, "Skipping close");
            }
        }
        registry.peers.insert(conn_id, peer);
        let connections = registry.peers.len();
        drop(registry);

        if shutting_down {
            info!(conn_id, connections, "Client connected during shutdown, closing");
        } else {
            info!(conn_id, connections, "Client connected");
        }
        conn_id
    }

    /// Handle one inbound frame from `conn_id`.
    pub fn on_message(&self, conn_id: u64, frame: &str) -> MessageOutcome {
        self.dispatch(conn_id, protocol::parse(frame))
    }

    /// Handle one inbound binary frame from `conn_id`.
    pub fn on_binary_message(&self, conn_id: u64, frame: &[u8]) -> MessageOutcome {
        self.dispatch(conn_id, protocol::parse_bytes(frame))
    }

    fn dispatch(&self, conn_id: u64, parsed: ParseResult) -> MessageOutcome {
        match parsed {
            ParseResult::Complete(Command::SendMessage { data }) => {
                trace!(conn_id, len = data.len(), "Relaying message");
                MessageOutcome::Broadcast(self.broadcast(&data))
            }
            ParseResult::Complete(Command::Unrecognized { action }) => {
                warn!(conn_id, ?action, "Unrecognized message format");
                MessageOutcome::Ignored
            }
            ParseResult::Error(e) => {
                error!(conn_id, error = %e, "Error parsing message");
                MessageOutcome::Malformed
            }
        }
    }

    /// Send `payload` to every registered connection, including the sender.
    ///
    /// Connections whose transport is already closed are removed during the
    /// pass. A send that fails after the open check is counted but the entry
    /// stays; its own close or error path removes it.
    pub fn broadcast(&self, payload: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut registry = self.lock();

        registry.peers.retain(|&conn_id, peer| {
            if !peer.is_open() {
                warn!(conn_id, "Removing closed connection");
                report.failure += 1;
                return false;
            }
            match peer.send(payload) {
                Ok(()) => report.success += 1,
                Err(e) => {
                    warn!(conn_id, error = %e, "Failed to send message");
                    report.failure += 1;
                }
            }
            true
        });
        drop(registry);

        info!(
            success = report.success,
            failure = report.failure,
            "Broadcast complete"
        );
        report
    }

    /// Deregister `conn_id` after its transport closed. Idempotent.
    pub fn on_closed(&self, conn_id: u64) {
        let connections = self.remove(conn_id);
        info!(conn_id, connections, "Client disconnected");
    }

    /// Deregister `conn_id` after a transport error.
    pub fn on_error(&self, conn_id: u64, err: &dyn std::error::Error) {
        error!(conn_id, error = %err, "Connection error");
        let connections = self.remove(conn_id);
        info!(conn_id, connections, "Client removed after error");
    }

    fn remove(&self, conn_id: u64) -> usize {
        let mut registry = self.lock();
        registry.peers.remove(&conn_id);
        registry.peers.len()
    }

    /// Ask every registered transport to close. Returns how many close
    /// requests were queued.
    ///
    /// Entries are left in place; each connection deregisters itself once
    /// its transport finishes closing. Transports accepted after this call
    /// are asked to close as soon as they register.
    pub fn shutdown(&self) -> usize {
        let mut registry = self.lock();
        registry.shutting_down = true;
        let mut requested = 0;
        for (&conn_id, peer) in registry.peers.iter() {
            match peer.close() {
                Ok(()) => requested += 1,
                Err(e) => trace!(conn_id, error = %e, "Skipping close"),
            }
        }
        let connections = registry.peers.len();
        drop(registry);

        info!(requested, connections, "Closing all connections");
        requested
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().peers.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, conn_id: u64) -> bool {
        self.lock().peers.contains_key(&conn_id)
    }

    /// Sorted snapshot of registered ids.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
