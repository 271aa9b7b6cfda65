//! Signaling channels for the group-call session manager.

mod local;
mod websocket;

pub use local::{LocalRelay, LocalRelayChannel};
pub use websocket::{WebSocketChannel, websocket_url};
