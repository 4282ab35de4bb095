//! Settings structs.
//!
//! Field names are camelCase in the JSON file. Every struct uses
//! `#[serde(default)]` so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomcastSettings {
    /// Network and connection limits.
    pub server: ServerSettings,
    /// Management API and upgrade authentication.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RoomcastSettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if s.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if s.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if s.heartbeat_timeout_ms < s.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) must not be shorter than heartbeatIntervalMs ({})",
                s.heartbeat_timeout_ms, s.heartbeat_interval_ms
            )));
        }
        if self.auth.api_tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(SettingsError::InvalidValue(
                "auth.apiTokens must not contain empty tokens".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks a free port).
    pub port: u16,
    /// Upper bound on simultaneously admitted connections.
    pub max_connections: usize,
    /// Heartbeat sweep period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is evicted, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Per-frame socket write deadline in milliseconds.
    pub write_timeout_ms: u64,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            send_queue_capacity: 256,
            max_message_size: 512 * 1024,
        }
    }
}

/// Credentials accepted by the management API and the upgrade endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Accepted bearer tokens. Empty disables the management API.
    pub api_tokens: Vec<String>,
    /// Refuse WebSocket upgrades that carry no valid token.
    pub require_ws_auth: bool,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact text format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RoomcastSettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.max_connections, 1000);
        assert_eq!(s.server.heartbeat_interval_ms, 30_000);
        assert_eq!(s.server.heartbeat_timeout_ms, 60_000);
        assert_eq!(s.server.send_queue_capacity, 256);
        assert!(s.auth.api_tokens.is_empty());
        assert!(!s.auth.require_ws_auth);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn defaults_validate() {
        RoomcastSettings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RoomcastSettings::default()).unwrap();
        assert_eq!(json["server"]["heartbeatIntervalMs"], 30_000);
        assert_eq!(json["auth"]["requireWsAuth"], false);
    }

    #[test]
    fn timeout_shorter_than_interval_rejected() {
        let mut s = RoomcastSettings::default();
        s.server.heartbeat_timeout_ms = 1_000;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeatTimeoutMs"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut s = RoomcastSettings::default();
        s.server.max_connections = 0;
        assert!(s.validate().is_err());

        let mut s = RoomcastSettings::default();
        s.server.send_queue_capacity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn blank_token_rejected() {
        let mut s = RoomcastSettings::default();
        s.auth.api_tokens = vec!["good".into(), "  ".into()];
        assert!(s.validate().is_err());
    }
}
