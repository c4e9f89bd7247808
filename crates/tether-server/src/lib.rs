//! tether-server: the tether relay gateway.
//!
//! Accepts backend and client WebSocket connections on separate ports,
//! authenticates both sides, routes opaque messages between them and tunnels
//! HTTP calls to backends that have no reachable address of their own.

pub mod auth;
pub mod config;
pub mod registry;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::{ConfigOverrides, GatewayConfig};
pub use relay::{BackendSession, Flow, GatewayStats, HttpCall, RelayEngine};
pub use server::{GatewayServer, RunningGateway};
