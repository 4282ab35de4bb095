//! # roomcast-server
//!
//! Axum HTTP + `WebSocket` server for room-based realtime messaging.
//!
//! - Connection registry with bounded per-connection send queues
//! - Room subscriptions with a consistent two-way membership index
//! - Heartbeat supervision that evicts silent connections
//! - Bearer-authenticated management API for broadcast and stats
//! - Prometheus metrics and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
