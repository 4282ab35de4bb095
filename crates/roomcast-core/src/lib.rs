//! # roomcast-core
//!
//! Shared vocabulary for the roomcast crates:
//!
//! - **IDs**: [`ConnectionId`] and [`RoomId`] newtypes
//! - **Frames**: outbound [`Frame`] constructors and inbound [`InboundMessage`] parsing
//! - **Errors**: protocol, transport, auth and timeout errors via `thiserror`
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;

pub use errors::{AuthError, ProtocolError, TimeoutError, TransportError};
pub use frame::{Frame, InboundMessage};
pub use ids::{ConnectionId, RoomId};
