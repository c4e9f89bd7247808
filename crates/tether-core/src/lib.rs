//! tether-core: Shared protocol library for the tether relay gateway.
//!
//! Provides the JSON envelope types exchanged between backends, clients and
//! the gateway, the text codec, the error taxonomy, identity helpers and
//! constant-time secret verification.

pub mod codec;
pub mod error;
pub mod headers;
pub mod identity;
pub mod messages;
pub mod secret;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, MAX_FRAME_SIZE};
pub use error::{ErrorCode, TetherError, TetherResult};
pub use identity::{backend_id_for_device, new_client_id, new_device_id, new_request_id};
pub use messages::{BackendSummary, HttpProxyRequest, HttpProxyResponse};
pub use secret::SecretVerifier;
