//! Broadcast relay module
//!
//! Tracks live connections and forwards each client's messages to every other client.

mod broadcaster;
mod connection;
mod registry;

pub use broadcaster::*;
pub use connection::*;
pub use registry::*;
