//! Server configuration.

use std::time::Duration;

use roomcast_settings::RoomcastSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the roomcast server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat sweep period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is evicted, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Socket write deadline in milliseconds.
    pub write_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Bearer tokens accepted by the management API.
    pub api_tokens: Vec<String>,
    /// Refuse WebSocket upgrades without a valid token.
    pub require_ws_auth: bool,
}

impl ServerConfig {
    /// Heartbeat sweep period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Eviction threshold.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Socket write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            send_queue_capacity: 256,
            max_message_size: 512 * 1024,
            api_tokens: Vec::new(),
            require_ws_auth: false,
        }
    }
}

impl From<&RoomcastSettings> for ServerConfig {
    fn from(settings: &RoomcastSettings) -> Self {
        let s = &settings.server;
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval_ms: s.heartbeat_interval_ms,
            heartbeat_timeout_ms: s.heartbeat_timeout_ms,
            write_timeout_ms: s.write_timeout_ms,
            send_queue_capacity: s.send_queue_capacity,
            max_message_size: s.max_message_size,
            api_tokens: settings.auth.api_tokens.clone(),
            require_ws_auth: settings.auth.require_ws_auth,
        }
    }
}
