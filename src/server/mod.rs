//! WebSocket server module
//!
//! Accepts WebSocket clients and connects them to the broadcast relay.

mod connection;
mod websocket;

pub use connection::*;
pub use websocket::*;
