//! tether-client: both ends that dial out to a tether gateway.
//!
//! [`BackendAgent`] keeps a backend registered and hands relayed traffic to a
//! [`BackendHandler`]; [`GatewayClient`] is the application side that picks a
//! backend and talks to it. Either can reach the gateway through a SOCKS5
//! proxy.
//!
//! # Quick Start
//!
//! ```no_run
//! use tether_client::GatewayClient;
//!
//! # async fn example() -> tether_core::TetherResult<()> {
//! let mut client = GatewayClient::connect("ws://gateway:7401", "admission-secret").await?;
//! let backends = client.list_backends().await?;
//! let backend = &backends[0].backend_id;
//!
//! client.connect_backend(backend, "api-key").await?;
//! client.send_to_backend(backend, serde_json::json!({"hello": "world"})).await?;
//! if let Some(event) = client.next_event().await {
//!     println!("{event:?}");
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod handler;
pub mod http_forward;
pub mod proxy;
pub mod transport;

pub use backend::{BackendAgent, BackendConfig, BackendHandle, LinkState};
pub use client::{ClientEvent, GatewayClient};
pub use handler::{BackendHandler, BoxFuture, Responder};
pub use http_forward::LocalHttpForwarder;
pub use proxy::ProxyConfig;

pub use tether_core::{TetherError, TetherResult};
