//! Error hierarchy for the gateway.
//!
//! - [`ProtocolError`]: an inbound frame could not be understood. Answered
//!   with an `error` frame; the connection stays open.
//! - [`TransportError`]: enqueueing to or writing on a single connection
//!   failed. Only that connection is affected.
//! - [`AuthError`]: a request carried no usable credential. Rejected at the
//!   HTTP boundary.
//! - [`TimeoutError`]: a connection stayed silent past the heartbeat timeout.

use std::time::Duration;

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// ProtocolError
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound frame that could not be dispatched.
///
/// The `Display` text is sent verbatim to the client as the `message` field
/// of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Payload was JSON but not an object with a string `type`.
    #[error("frame must be an object with a string \"type\" field")]
    MissingType,

    /// `data` was present but not an object.
    #[error("frame \"data\" must be an object")]
    InvalidData,

    /// The `type` is not one the router handles.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required `data` field was absent.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A `data` field had the wrong JSON type.
    #[error("{field} must be {expected}")]
    InvalidField {
        /// Field name inside `data`.
        field: &'static str,
        /// Human-readable expected type.
        expected: &'static str,
    },

    /// Binary frame that is not UTF-8.
    #[error("binary frames must contain UTF-8 JSON")]
    NonUtf8Binary,
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure delivering to, or reading from, one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection's outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,

    /// The connection's writer has gone away.
    #[error("outbound queue closed")]
    QueueClosed,

    /// The socket rejected a write or read.
    #[error("socket error: {0}")]
    Socket(String),

    /// A socket write did not complete in time.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthError
// ─────────────────────────────────────────────────────────────────────────────

/// Credential check failure on the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header (or token query parameter).
    #[error("missing bearer token")]
    MissingCredential,

    /// Header present but not of the form `Bearer <token>`.
    #[error("authorization header must use the Bearer scheme")]
    MalformedHeader,

    /// Token did not match any configured token.
    #[error("invalid bearer token")]
    InvalidToken,

    /// No tokens are configured, so nothing can authenticate.
    #[error("management API has no tokens configured")]
    NotConfigured,
}

// ─────────────────────────────────────────────────────────────────────────────
// TimeoutError
// ─────────────────────────────────────────────────────────────────────────────

/// A connection exceeded the heartbeat timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no activity for {idle:?} (timeout {timeout:?})")]
pub struct TimeoutError {
    /// Time since the connection was last seen.
    pub idle: Duration,
    /// Configured threshold.
    pub timeout: Duration,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_messages_are_client_readable() {
        assert_eq!(
            ProtocolError::UnknownType("dance".into()).to_string(),
            "unknown message type: dance"
        );
        assert_eq!(
            ProtocolError::MissingField("room_id").to_string(),
            "room_id is required"
        );
        assert_eq!(
            ProtocolError::InvalidField {
                field: "room_id",
                expected: "an integer",
            }
            .to_string(),
            "room_id must be an integer"
        );
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::QueueFull.to_string(), "outbound queue full");
        let err = TransportError::WriteTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn auth_error_display() {
        assert_eq!(AuthError::InvalidToken.to_string(), "invalid bearer token");
        assert!(AuthError::NotConfigured.to_string().contains("no tokens"));
    }

    #[test]
    fn timeout_error_display_includes_both_durations() {
        let err = TimeoutError {
            idle: Duration::from_secs(61),
            timeout: Duration::from_secs(60),
        };
        let text = err.to_string();
        assert!(text.contains("61s"));
        assert!(text.contains("60s"));
    }
}
