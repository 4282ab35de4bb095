//! WebSocket connection management, rooms, heartbeat, message dispatch, and broadcasting.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod rooms;
pub mod session;
