//! Server-initiated fan-out and aggregate stats.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use roomcast_core::{ConnectionId, Frame, RoomId};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, LivenessState, Principal};
use super::registry::{ConnectionRegistry, RegistryError};
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections a send was attempted on.
    pub recipients: usize,
    /// Of those, connections whose queue rejected the frame.
    pub failed: usize,
}

impl DeliveryReport {
    /// Connections the frame was queued for.
    pub fn delivered(&self) -> usize {
        self.recipients - self.failed
    }
}

/// Aggregate view of the registry, computed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Live connections.
    pub total_connections: usize,
    /// Rooms with at least one subscriber.
    pub total_rooms: usize,
    /// (connection, room) pairs.
    pub total_subscriptions: usize,
    /// Subscriber count per room.
    pub rooms: BTreeMap<RoomId, usize>,
    /// Connections admitted since start.
    pub connections_admitted: u64,
    /// Connections removed by the heartbeat supervisor.
    pub connections_evicted: u64,
    /// Inbound frames, valid or not.
    pub messages_received: u64,
    /// Frames queued for writers.
    pub messages_sent: u64,
    /// Frames a full or closed queue rejected.
    pub send_failures: u64,
    /// Inbound payload bytes.
    pub bytes_received: u64,
    /// Seconds since the gateway was created.
    pub uptime_secs: u64,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
}

/// One row of the client listing.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Principal established at upgrade.
    pub principal: Principal,
    /// Liveness as of the listing.
    pub state: LivenessState,
    /// Wall-clock admission time.
    pub connected_at: DateTime<Utc>,
    /// Whole seconds since the last inbound activity.
    pub last_seen_secs_ago: u64,
    /// Subscribed rooms, ascending.
    pub subscriptions: Vec<RoomId>,
    /// Frames dropped by a full or closed queue.
    pub dropped_messages: u64,
}

/// Management operations over the live registry.
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
}

impl Gateway {
    /// Create a gateway; uptime is measured from now.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
        }
    }

    /// Send `frame` to every live connection.
    pub fn broadcast(&self, frame: &Frame) -> DeliveryReport {
        let targets = self.registry.snapshot();
        let report = fan_out(&targets, frame);
        debug!(
            frame_type = %frame.frame_type,
            recipients = report.recipients,
            failed = report.failed,
            "broadcast to all"
        );
        report
    }

    /// Send `frame` to the members of `room`. Unknown rooms reach nobody.
    pub fn broadcast_to_room(&self, room: RoomId, frame: &Frame) -> DeliveryReport {
        let targets = self.registry.room_connections(room);
        let report = fan_out(&targets, frame);
        debug!(
            frame_type = %frame.frame_type,
            room_id = %room,
            recipients = report.recipients,
            failed = report.failed,
            "broadcast to room"
        );
        report
    }

    /// Send `frame` to a single connection.
    pub fn send_to(&self, id: &ConnectionId, frame: &Frame) -> Result<DeliveryReport, RegistryError> {
        let conn = self
            .registry
            .lookup(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        Ok(fan_out(&[conn], frame))
    }

    /// Current aggregate counts.
    pub fn stats(&self) -> StatsSnapshot {
        let counters = self.registry.counters();
        let rooms = self.registry.rooms().room_sizes();
        StatsSnapshot {
            total_connections: self.registry.len(),
            total_rooms: rooms.len(),
            total_subscriptions: rooms.values().sum(),
            rooms,
            connections_admitted: counters.admitted(),
            connections_evicted: counters.evicted(),
            messages_received: counters.messages_received(),
            messages_sent: counters.messages_sent(),
            send_failures: counters.send_failures(),
            bytes_received: counters.bytes_received(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            started_at: self.started_at_wall,
        }
    }

    /// Listing of live connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut rows: Vec<ConnectionInfo> = self
            .registry
            .snapshot()
            .iter()
            .map(|conn| self.describe(conn, now))
            .collect();
        rows.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    /// Listing row for one live connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.registry
            .lookup(id)
            .map(|conn| self.describe(&conn, Instant::now()))
    }

    /// Forcibly disconnect a live connection.
    ///
    /// The connection leaves every room and its session tasks are told to
    /// close. A second call for the same id is `UnknownConnection`.
    pub fn disconnect(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        let conn = self
            .registry
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        info!(conn_id = %conn.id, "connection disconnected by operator");
        Ok(())
    }

    fn describe(&self, conn: &Connection, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: conn.id.clone(),
            principal: conn.principal,
            state: conn.state(),
            connected_at: conn.connected_at,
            last_seen_secs_ago: conn.idle(now).as_secs(),
            subscriptions: self.registry.subscriptions(&conn.id).into_iter().collect(),
            dropped_messages: conn.drop_count(),
        }
    }

    /// The registry this gateway reads.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// Serialize once and enqueue on each target; failures are counted, not fatal.
fn fan_out(targets: &[Arc<Connection>], frame: &Frame) -> DeliveryReport {
    let mut report = DeliveryReport {
        recipients: targets.len(),
        failed: 0,
    };
    let json: Arc<str> = match frame.to_json() {
        Ok(j) => Arc::from(j),
        Err(e) => {
            warn!(frame_type = %frame.frame_type, error = %e, "failed to serialize frame");
            report.failed = targets.len();
            return report;
        }
    };

    for conn in targets {
        if let Err(e) = conn.send_text(json.clone()) {
            report.failed += 1;
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            warn!(conn_id = %conn.id, error = %e, "failed to deliver frame");
        }
    }
    report
}
