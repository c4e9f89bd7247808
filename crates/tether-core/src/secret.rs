//! Constant-time verification of shared gateway secrets.
//!
//! The configured secret is never compared byte-by-byte. Instead it is
//! HMAC-signed once with a per-process random key, and each candidate is
//! checked with `ring::hmac::verify`, which compares tags in constant time.
//! Candidate length therefore leaks nothing either.

use rand::RngCore;
use ring::hmac;

/// Holds one configured secret and verifies candidates against it.
pub struct SecretVerifier {
    key: hmac::Key,
    tag: Vec<u8>,
}

impl SecretVerifier {
    pub fn new(secret: &str) -> Self {
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
        let tag = hmac::sign(&key, secret.as_bytes()).as_ref().to_vec();
        Self { key, tag }
    }

    /// Whether `candidate` equals the configured secret.
    pub fn verify(&self, candidate: &str) -> bool {
        hmac::verify(&self.key, candidate.as_bytes(), &self.tag).is_ok()
    }
}

impl std::fmt::Debug for SecretVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretVerifier(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_secret() {
        let v = SecretVerifier::new("S3cret!");
        assert!(v.verify("S3cret!"));
    }

    #[test]
    fn rejects_others() {
        let v = SecretVerifier::new("S3cret!");
        assert!(!v.verify("S3cret"));
        assert!(!v.verify("S3cret!!"));
        assert!(!v.verify(""));
        assert!(!v.verify("s3cret!"));
    }

    #[test]
    fn debug_does_not_leak() {
        let v = SecretVerifier::new("hunter2");
        assert!(!format!("{v:?}").contains("hunter2"));
    }
}
