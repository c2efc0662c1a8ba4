//! WebSocket protocol engine.
//!
//! A WebSocket is opened with [`Client::websocket`](crate::Client::websocket) and a
//! [`WebSocketUpgrade`], which sends the upgrade request, validates the `101 Switching Protocols`
//! response and takes over the connection. From then on a [`WebSocket`] exchanges [`Frame`]s with
//! the peer: incoming frames are dispatched to [`WebSocketListener`]s, raw and aggregated, and
//! outgoing messages are split into frames no larger than the configured maximum.

mod frame;
mod handshake;
mod socket;
mod upgrade;

pub use self::frame::{close_code, Frame, OpCode, MAX_CONTROL_PAYLOAD};
pub use self::handshake::{accept_key, generate_key, validate};
pub use self::socket::{WebSocket, WebSocketListener};
pub use self::upgrade::WebSocketUpgrade;
pub use crate::config::WebSocketConfig;
