//! JSON frames exchanged over the realtime connection.
//!
//! Every frame on the wire is an object `{type, data, timestamp}`. Outbound
//! frames are built with the constructors on [`Frame`]; inbound text is
//! decoded into an [`InboundMessage`] by [`InboundMessage::parse`], which is
//! the single place protocol validation happens.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::ProtocolError;
use crate::ids::{ConnectionId, RoomId};

/// Frame `type` strings.
pub mod kind {
    /// Sent once on admission.
    pub const WELCOME: &str = "welcome";
    /// Client liveness probe.
    pub const PING: &str = "ping";
    /// Reply to [`PING`].
    pub const PONG: &str = "pong";
    /// Periodic server keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Join a room.
    pub const SUBSCRIBE_ROOM: &str = "subscribe_room";
    /// Leave a room.
    pub const UNSUBSCRIBE_ROOM: &str = "unsubscribe_room";
    /// Ack for [`SUBSCRIBE_ROOM`].
    pub const ROOM_SUBSCRIBED: &str = "room_subscribed";
    /// Ack for [`UNSUBSCRIBE_ROOM`].
    pub const ROOM_UNSUBSCRIBED: &str = "room_unsubscribed";
    /// Ask for the connection's rooms.
    pub const GET_SUBSCRIPTIONS: &str = "get_subscriptions";
    /// Reply to [`GET_SUBSCRIPTIONS`].
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    /// Malformed or unknown input.
    pub const ERROR: &str = "error";
}

/// Greeting text carried by the welcome frame.
const WELCOME_MESSAGE: &str = "Connected to roomcast";

/// Format a timestamp the way every frame field does (RFC 3339, millis, `Z`).
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// A typed JSON frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame type.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Payload object.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// When the frame was built.
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(frame_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    fn from_json(frame_type: &str, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(frame_type, data)
    }

    /// Greeting sent once when a connection is admitted.
    pub fn welcome(id: &ConnectionId, principal: &str, authenticated: bool) -> Self {
        Self::from_json(
            kind::WELCOME,
            json!({
                "client_id": id,
                "principal": principal,
                "authenticated": authenticated,
                "server_time": rfc3339(Utc::now()),
                "message": WELCOME_MESSAGE,
            }),
        )
    }

    /// Reply to a client `ping`.
    pub fn pong() -> Self {
        Self::from_json(kind::PONG, json!({ "timestamp": rfc3339(Utc::now()) }))
    }

    /// Periodic keepalive pushed by the heartbeat supervisor.
    pub fn heartbeat(connected_clients: usize, uptime: Duration) -> Self {
        Self::from_json(
            kind::HEARTBEAT,
            json!({
                "server_time": rfc3339(Utc::now()),
                "connected_clients": connected_clients,
                "uptime_secs": uptime.as_secs(),
            }),
        )
    }

    /// Ack for a successful `subscribe_room`.
    pub fn room_subscribed(room: RoomId) -> Self {
        Self::from_json(
            kind::ROOM_SUBSCRIBED,
            json!({ "room_id": room, "subscribed": true }),
        )
    }

    /// Ack for `unsubscribe_room`. `was_subscribed` is false when the
    /// connection was not in the room.
    pub fn room_unsubscribed(room: RoomId, was_subscribed: bool) -> Self {
        Self::from_json(
            kind::ROOM_UNSUBSCRIBED,
            json!({ "room_id": room, "was_subscribed": was_subscribed }),
        )
    }

    /// Reply to `get_subscriptions`.
    pub fn subscriptions(rooms: &[RoomId]) -> Self {
        Self::from_json(kind::SUBSCRIPTIONS, json!({ "room_ids": rooms }))
    }

    /// Error reply; the connection stays open.
    pub fn error(message: impl Into<String>) -> Self {
        Self::from_json(kind::ERROR, json!({ "message": message.into() }))
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&ProtocolError> for Frame {
    fn from(err: &ProtocolError) -> Self {
        Self::error(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// A validated client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMessage {
    /// `ping`
    Ping,
    /// `subscribe_room`
    SubscribeRoom(RoomId),
    /// `unsubscribe_room`
    UnsubscribeRoom(RoomId),
    /// `get_subscriptions`
    GetSubscriptions,
}

impl InboundMessage {
    /// Decode and validate one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::MissingType);
        };
        let Some(Value::String(frame_type)) = obj.remove("type") else {
            return Err(ProtocolError::MissingType);
        };
        let data = match obj.remove("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(ProtocolError::InvalidData),
        };

        match frame_type.as_str() {
            kind::PING => Ok(Self::Ping),
            kind::SUBSCRIBE_ROOM => room_id(&data).map(Self::SubscribeRoom),
            kind::UNSUBSCRIBE_ROOM => room_id(&data).map(Self::UnsubscribeRoom),
            kind::GET_SUBSCRIPTIONS => Ok(Self::GetSubscriptions),
            _ => Err(ProtocolError::UnknownType(frame_type)),
        }
    }

    /// Wire `type` of this message, for logs and metrics labels.
    pub const fn frame_type(self) -> &'static str {
        match self {
            Self::Ping => kind::PING,
            Self::SubscribeRoom(_) => kind::SUBSCRIBE_ROOM,
            Self::UnsubscribeRoom(_) => kind::UNSUBSCRIBE_ROOM,
            Self::GetSubscriptions => kind::GET_SUBSCRIPTIONS,
        }
    }
}

/// `data.room_id` must be a JSON integer.
fn room_id(data: &Map<String, Value>) -> Result<RoomId, ProtocolError> {
    match data.get("room_id") {
        None | Some(Value::Null) => Err(ProtocolError::MissingField("room_id")),
        Some(v) => v.as_i64().map(RoomId::new).ok_or(ProtocolError::InvalidField {
            field: "room_id",
            expected: "an integer",
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
