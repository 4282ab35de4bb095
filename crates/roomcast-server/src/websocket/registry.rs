//! Connection registry: the single owner of live connections.
//!
//! The registry map and the [`RoomIndex`] are the only shared mutable state
//! on the realtime path. Locks are taken per operation and always in the
//! same order (connections, then rooms). Nothing here awaits or writes to a
//! socket while holding a lock; sends go through each connection's bounded
//! queue.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use roomcast_core::{ConnectionId, Frame, RoomId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, Outbound, Principal};
use super::rooms::RoomIndex;

/// Registry operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection limit has been reached.
    #[error("server at capacity ({limit} connections)")]
    AtCapacity {
        /// Configured maximum.
        limit: usize,
    },
    /// No live connection has this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Lifetime traffic counters shared by every connection.
#[derive(Debug, Default)]
pub struct HubCounters {
    admitted: AtomicU64,
    evicted: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl HubCounters {
    pub(crate) fn record_admitted(&self) {
        let _ = self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        let _ = self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        let _ = self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections ever admitted.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Connections removed by the heartbeat supervisor.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Inbound frames processed.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Inbound payload bytes processed.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Outbound items successfully queued.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Outbound items rejected by a full or closed queue.
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

/// A freshly admitted connection and the receiving half of its queue.
pub struct Admission {
    /// Registered connection.
    pub connection: Arc<Connection>,
    /// Items for the writer task. The welcome frame is already queued.
    pub outbound: mpsc::Receiver<Outbound>,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("connection", &self.connection.id)
            .finish_non_exhaustive()
    }
}

/// Tracks every live connection and its room memberships.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    rooms: RoomIndex,
    counters: Arc<HubCounters>,
    max_connections: usize,
    send_queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(max_connections: usize, send_queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RoomIndex::new(),
            counters: Arc::new(HubCounters::default()),
            max_connections,
            send_queue_capacity: send_queue_capacity.max(1),
        }
    }

    /// Admit a new connection: assign an id, start it ACTIVE and queue the
    /// welcome frame.
    pub fn admit(&self, principal: Principal) -> Result<Admission, RegistryError> {
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);

        let connection = {
            let mut conns = self.connections.write();
            if conns.len() >= self.max_connections {
                warn!(limit = self.max_connections, "rejecting connection, at capacity");
                return Err(RegistryError::AtCapacity {
                    limit: self.max_connections,
                });
            }
            let mut id = ConnectionId::new();
            while conns.contains_key(&id) {
                id = ConnectionId::new();
            }
            let connection = Arc::new(Connection::new(
                id.clone(),
                principal,
                tx,
                self.counters.clone(),
                Instant::now(),
            ));
            let _ = conns.insert(id, connection.clone());
            connection
        };
        self.counters.record_admitted();

        let welcome = Frame::welcome(
            &connection.id,
            principal.as_str(),
            principal.is_authenticated(),
        );
        if let Err(e) = connection.send_frame(&welcome) {
            warn!(conn_id = %connection.id, error = %e, "failed to queue welcome frame");
        }
        info!(conn_id = %connection.id, principal = principal.as_str(), "connection admitted");

        Ok(Admission {
            connection,
            outbound: rx,
        })
    }

    /// Look up a live connection.
    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Remove a connection from every room, then release its id.
    ///
    /// Idempotent: returns the connection only for the call that removed
    /// it. The connection is marked DEAD and its tasks are told to close.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut conns = self.connections.write();
            if !conns.contains_key(id) {
                return None;
            }
            let left = self.rooms.remove_connection_everywhere(id);
            if !left.is_empty() {
                debug!(conn_id = %id, rooms = left.len(), "left rooms on removal");
            }
            conns.remove(id)
        };
        if let Some(conn) = &removed {
            let _ = conn.mark_dead();
            conn.close();
            info!(conn_id = %id, "connection removed");
        }
        removed
    }

    /// Record activity on a connection. Returns `false` if it is unknown
    /// or already DEAD.
    pub fn mark_seen(&self, id: &ConnectionId) -> bool {
        self.lookup(id)
            .is_some_and(|conn| conn.mark_seen(Instant::now()))
    }

    /// Subscribe a live connection to a room.
    ///
    /// Returns `Ok(false)` if it was already subscribed.
    pub fn subscribe(&self, id: &ConnectionId, room: RoomId) -> Result<bool, RegistryError> {
        // Holding the read lock keeps a concurrent `remove` from leaving a
        // stale member behind.
        let conns = self.connections.read();
        if !conns.contains_key(id) {
            return Err(RegistryError::UnknownConnection(id.clone()));
        }
        Ok(self.rooms.subscribe(id, room))
    }

    /// Unsubscribe a live connection from a room.
    ///
    /// Returns `Ok(false)` if it was not subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, room: RoomId) -> Result<bool, RegistryError> {
        let conns = self.connections.read();
        if !conns.contains_key(id) {
            return Err(RegistryError::UnknownConnection(id.clone()));
        }
        Ok(self.rooms.unsubscribe(id, room))
    }

    /// The connection's subscription set.
    pub fn subscriptions(&self, id: &ConnectionId) -> BTreeSet<RoomId> {
        self.rooms.rooms_of(id)
    }

    /// Ids subscribed to `room`; empty for unknown rooms.
    pub fn members_of(&self, room: RoomId) -> HashSet<ConnectionId> {
        self.rooms.members_of(room)
    }

    /// Live connections subscribed to `room`.
    pub fn room_connections(&self, room: RoomId) -> Vec<Arc<Connection>> {
        let conns = self.connections.read();
        self.rooms
            .members_of(room)
            .iter()
            .filter_map(|id| conns.get(id).cloned())
            .collect()
    }

    /// Every live connection at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another connection would be refused.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections
    }

    /// Configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// The room index.
    pub fn rooms(&self) -> &RoomIndex {
        &self.rooms
    }

    /// Lifetime counters.
    pub fn counters(&self) -> &HubCounters {
        &self.counters
    }
}
