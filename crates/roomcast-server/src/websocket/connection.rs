//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use roomcast_core::{ConnectionId, Frame, TransportError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::HubCounters;

/// Item queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized frame, written as one text message.
    Text(Arc<str>),
    /// A serialized heartbeat frame, written as a text message followed by a
    /// transport-level Ping.
    Heartbeat(Arc<str>),
}

impl Outbound {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) | Self::Heartbeat(t) => t.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Liveness as seen by the heartbeat supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    /// Seen since the last heartbeat.
    Active,
    /// A heartbeat went out and nothing has come back yet.
    AwaitingPong,
    /// Timed out or removed. Terminal.
    Dead,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// No credential presented.
    Anonymous,
    /// Presented a configured bearer token.
    Bearer,
}

impl Principal {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Bearer => "bearer",
        }
    }

    /// Whether a credential was verified.
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Bearer)
    }
}

struct Liveness {
    state: LivenessState,
    last_seen: Instant,
}

/// Represents a connected WebSocket client.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Authentication principal established at upgrade.
    pub principal: Principal,
    /// Wall-clock admission time, for listings.
    pub connected_at: DateTime<Utc>,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Outbound>,
    liveness: Mutex<Liveness>,
    /// Count of messages dropped due to a full or closed channel.
    dropped_messages: AtomicU64,
    counters: Arc<HubCounters>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a new connection in the ACTIVE state, last seen at `now`.
    pub fn new(
        id: ConnectionId,
        principal: Principal,
        tx: mpsc::Sender<Outbound>,
        counters: Arc<HubCounters>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            principal,
            connected_at: Utc::now(),
            tx,
            liveness: Mutex::new(Liveness {
                state: LivenessState::Active,
                last_seen: now,
            }),
            dropped_messages: AtomicU64::new(0),
            counters,
            closed: CancellationToken::new(),
        }
    }

    /// Queue an item for the writer task without waiting.
    pub fn send(&self, item: Outbound) -> Result<(), TransportError> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.counters.record_sent();
                Ok(())
            }
            Err(e) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                self.counters.record_send_failure();
                Err(match e {
                    TrySendError::Full(_) => TransportError::QueueFull,
                    TrySendError::Closed(_) => TransportError::QueueClosed,
                })
            }
        }
    }

    /// Queue an already-serialized frame.
    pub fn send_text(&self, text: Arc<str>) -> Result<(), TransportError> {
        self.send(Outbound::Text(text))
    }

    /// Serialize a frame and queue it.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let json = frame
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_text(Arc::from(json))
    }

    /// Record inbound activity. Resets liveness to ACTIVE unless DEAD.
    ///
    /// Returns `false` for a DEAD connection.
    pub fn mark_seen(&self, now: Instant) -> bool {
        let mut l = self.liveness.lock();
        if l.state == LivenessState::Dead {
            return false;
        }
        l.state = LivenessState::Active;
        l.last_seen = now;
        true
    }

    /// A heartbeat was sent: ACTIVE becomes AWAITING_PONG.
    pub fn mark_probed(&self) {
        let mut l = self.liveness.lock();
        if l.state == LivenessState::Active {
            l.state = LivenessState::AwaitingPong;
        }
    }

    /// Transition to DEAD. Returns `true` if this call made the transition.
    pub fn mark_dead(&self) -> bool {
        let mut l = self.liveness.lock();
        let was_dead = l.state == LivenessState::Dead;
        l.state = LivenessState::Dead;
        !was_dead
    }

    /// Transition to DEAD if idle for at least `timeout` as of `now`, or
    /// already DEAD. Returns the idle time when the connection is DEAD.
    ///
    /// The idle check and the transition happen under one lock, so activity
    /// recorded by [`mark_seen`](Self::mark_seen) either lands before the
    /// check and keeps the connection alive, or is refused afterwards.
    pub fn expire_if_idle(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        let mut l = self.liveness.lock();
        let idle = now.saturating_duration_since(l.last_seen);
        if l.state == LivenessState::Dead || idle >= timeout {
            l.state = LivenessState::Dead;
            Some(idle)
        } else {
            None
        }
    }

    /// Current liveness state.
    pub fn state(&self) -> LivenessState {
        self.liveness.lock().state
    }

    /// Last inbound activity.
    pub fn last_seen(&self) -> Instant {
        self.liveness.lock().last_seen
    }

    /// Time since last inbound activity, measured at `now`.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Signal the connection's tasks to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection is closed.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(
            ConnectionId::from("conn_1"),
            Principal::Anonymous,
            tx,
            Arc::new(HubCounters::default()),
            Instant::now(),
        );
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection(8);
        assert_eq!(conn.id.as_str(), "conn_1");
        assert_eq!(conn.state(), LivenessState::Active);
        assert_eq!(conn.drop_count(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn send_text_success() {
        let (conn, mut rx) = make_connection(8);
        conn.send_text(Arc::from("hello")).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, Outbound::Text(Arc::from("hello")));
    }

    #[tokio::test]
    async fn send_frame_serializes() {
        let (conn, mut rx) = make_connection(8);
        conn.send_frame(&Frame::pong()).unwrap();
        let Outbound::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "pong");
    }

    #[test]
    fn send_to_closed_channel() {
        let (conn, rx) = make_connection(8);
        drop(rx);
        let err = conn.send_text(Arc::from("x")).unwrap_err();
        assert_eq!(err, TransportError::QueueClosed);
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_to_full_channel() {
        let (conn, _rx) = make_connection(1);
        conn.send_text(Arc::from("msg1")).unwrap();
        assert_matches!(conn.send_text(Arc::from("msg2")), Err(TransportError::QueueFull));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_updates_shared_counters() {
        let counters = Arc::new(HubCounters::default());
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(
            ConnectionId::new(),
            Principal::Bearer,
            tx,
            counters.clone(),
            Instant::now(),
        );
        conn.send_text(Arc::from("a")).unwrap();
        let _ = conn.send_text(Arc::from("b"));
        assert_eq!(counters.messages_sent(), 1);
        assert_eq!(counters.send_failures(), 1);
    }

    #[test]
    fn probe_then_seen_returns_to_active() {
        let (conn, _rx) = make_connection(8);
        conn.mark_probed();
        assert_eq!(conn.state(), LivenessState::AwaitingPong);
        assert!(conn.mark_seen(Instant::now()));
        assert_eq!(conn.state(), LivenessState::Active);
    }

    #[test]
    fn probe_is_noop_when_already_awaiting() {
        let (conn, _rx) = make_connection(8);
        conn.mark_probed();
        conn.mark_probed();
        assert_eq!(conn.state(), LivenessState::AwaitingPong);
    }

    #[test]
    fn dead_is_terminal() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.mark_dead());
        assert!(!conn.mark_dead());
        assert!(!conn.mark_seen(Instant::now()));
        conn.mark_probed();
        assert_eq!(conn.state(), LivenessState::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_idle_respects_recent_activity() {
        let (conn, _rx) = make_connection(8);
        let timeout = Duration::from_secs(60);
        tokio::time::advance(timeout).await;
        let deadline = Instant::now();

        // Activity that lands before the check keeps the connection.
        assert!(conn.mark_seen(deadline));
        assert_eq!(conn.expire_if_idle(deadline, timeout), None);
        assert_eq!(conn.state(), LivenessState::Active);

        tokio::time::advance(timeout).await;
        assert_eq!(conn.expire_if_idle(Instant::now(), timeout), Some(timeout));
        // Activity after the transition is refused.
        assert!(!conn.mark_seen(Instant::now()));
        assert_eq!(conn.state(), LivenessState::Dead);
    }

    #[test]
    fn expire_if_idle_reports_dead_connections() {
        let (conn, _rx) = make_connection(8);
        let _ = conn.mark_dead();
        assert_eq!(
            conn.expire_if_idle(Instant::now(), Duration::from_secs(60)),
            Some(Duration::ZERO)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tracks_last_seen() {
        let (conn, _rx) = make_connection(8);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.idle(Instant::now()), Duration::from_secs(5));
        let _ = conn.mark_seen(Instant::now());
        assert_eq!(conn.idle(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn close_cancels_token() {
        let (conn, _rx) = make_connection(8);
        let token = conn.close_token();
        conn.close();
        assert!(conn.is_closed());
        assert!(token.is_cancelled());
    }

    #[test]
    fn principal_names() {
        assert_eq!(Principal::Anonymous.as_str(), "anonymous");
        assert!(!Principal::Anonymous.is_authenticated());
        assert!(Principal::Bearer.is_authenticated());
    }

    #[test]
    fn liveness_serializes_screaming() {
        let v = serde_json::to_value(LivenessState::AwaitingPong).unwrap();
        assert_eq!(v, "AWAITING_PONG");
    }

    #[test]
    fn outbound_len() {
        assert_eq!(Outbound::Heartbeat(Arc::from("abc")).len(), 3);
        assert!(Outbound::Text(Arc::from("")).is_empty());
    }
}
