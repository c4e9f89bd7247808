//! Identifiers used across the relay.
//!
//! Backend ids are derived from the backend's device id, so the same device
//! always maps to the same backend id: across reconnects, backend restarts and
//! gateway restarts. Client and request ids are random.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Number of hex characters of the device hash kept in a backend id.
const BACKEND_ID_HEX_LEN: usize = 12;

/// Derive the stable backend id for a device: `backend_` + SHA-256 prefix.
pub fn backend_id_for_device(device_id: &str) -> String {
    let hash = Sha256::digest(device_id.as_bytes());
    let hex = hex::encode(hash);
    format!("backend_{}", &hex[..BACKEND_ID_HEX_LEN])
}

/// Fresh gateway-assigned client id.
pub fn new_client_id() -> String {
    format!("client_{}", random_hex(16))
}

/// Fresh HTTP-tunnel request id.
pub fn new_request_id() -> String {
    format!("req_{}", random_hex(16))
}

/// Fresh device id for a backend that has none configured.
pub fn new_device_id() -> String {
    format!("dev_{}", random_hex(16))
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Shorten an id for log output.
pub fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(16)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
