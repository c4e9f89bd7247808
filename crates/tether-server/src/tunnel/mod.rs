//! HTTP tunnel: correlation table and HTTP ingress.

pub mod ingress;
pub mod pending;

pub use ingress::{router, CLIENT_ID_HEADER};
pub use pending::PendingRequests;
