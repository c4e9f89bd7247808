//! Transport plumbing: WebSocket listeners and per-peer outbound queues.

pub mod peer;
pub mod websocket;

pub use peer::{PeerHandle, PeerOutbox};
pub use websocket::{Inbound, WebSocketConnection};
