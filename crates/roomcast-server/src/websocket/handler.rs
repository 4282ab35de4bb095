//! Inbound frame dispatch.
//!
//! Every frame, valid or not, first refreshes the connection's liveness.
//! Valid frames are applied to the registry and answered; invalid ones are
//! answered with an `error` frame and otherwise ignored.

use std::sync::Arc;

use metrics::counter;
use roomcast_core::{Frame, InboundMessage, ProtocolError, RoomId, TransportError};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::connection::Connection;
use super::registry::{ConnectionRegistry, RegistryError};
use crate::metrics::WS_MESSAGES_RECEIVED_TOTAL;

/// Label used for frames that failed validation.
const INVALID: &str = "invalid";

/// Result of handling one inbound frame.
#[derive(Debug)]
pub struct HandleResult {
    /// Frame to send back.
    pub reply: Frame,
    /// Wire type of the request, or `"invalid"`.
    pub frame_type: &'static str,
    /// Validation failure, if any.
    pub error: Option<ProtocolError>,
}

/// Interprets inbound frames against the registry.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one text frame and compute the reply without sending it.
    #[instrument(skip_all, fields(conn_id = %conn.id, frame_type))]
    pub fn handle(&self, conn: &Connection, text: &str) -> HandleResult {
        let _ = conn.mark_seen(Instant::now());
        self.registry.counters().record_received(text.len());

        match InboundMessage::parse(text) {
            Ok(message) => {
                let frame_type = message.frame_type();
                let _ = tracing::Span::current().record("frame_type", frame_type);
                counter!(WS_MESSAGES_RECEIVED_TOTAL, "type" => frame_type).increment(1);
                debug!("dispatching frame");
                HandleResult {
                    reply: self.apply(conn, message),
                    frame_type,
                    error: None,
                }
            }
            Err(err) => self.reject(err),
        }
    }

    /// Answer a frame that never got as far as parsing (non-UTF-8 binary).
    pub fn handle_undecodable(&self, conn: &Connection, len: usize) -> HandleResult {
        let _ = conn.mark_seen(Instant::now());
        self.registry.counters().record_received(len);
        self.reject(ProtocolError::NonUtf8Binary)
    }

    /// Handle a frame and queue the reply on the connection.
    pub fn dispatch(&self, conn: &Connection, text: &str) -> Result<HandleResult, TransportError> {
        let result = self.handle(conn, text);
        conn.send_frame(&result.reply)?;
        Ok(result)
    }

    fn reject(&self, err: ProtocolError) -> HandleResult {
        counter!(WS_MESSAGES_RECEIVED_TOTAL, "type" => INVALID).increment(1);
        warn!(error = %err, "rejected inbound frame");
        HandleResult {
            reply: Frame::from(&err),
            frame_type: INVALID,
            error: Some(err),
        }
    }

    fn apply(&self, conn: &Connection, message: InboundMessage) -> Frame {
        match message {
            InboundMessage::Ping => Frame::pong(),
            InboundMessage::SubscribeRoom(room) => self.subscribe(conn, room),
            InboundMessage::UnsubscribeRoom(room) => self.unsubscribe(conn, room),
            InboundMessage::GetSubscriptions => {
                let rooms: Vec<RoomId> = self.registry.subscriptions(&conn.id).into_iter().collect();
                Frame::subscriptions(&rooms)
            }
        }
    }

    fn subscribe(&self, conn: &Connection, room: RoomId) -> Frame {
        match self.registry.subscribe(&conn.id, room) {
            Ok(added) => {
                debug!(room_id = %room, added, "subscribed to room");
                Frame::room_subscribed(room)
            }
            Err(e) => closing_error(&e),
        }
    }

    fn unsubscribe(&self, conn: &Connection, room: RoomId) -> Frame {
        match self.registry.unsubscribe(&conn.id, room) {
            Ok(was_subscribed) => {
                debug!(room_id = %room, was_subscribed, "unsubscribed from room");
                Frame::room_unsubscribed(room, was_subscribed)
            }
            Err(e) => closing_error(&e),
        }
    }
}

/// The connection was removed between admission and this frame.
fn closing_error(err: &RegistryError) -> Frame {
    debug!(error = %err, "frame for a connection that is closing");
    Frame::error("connection is closing")
}
