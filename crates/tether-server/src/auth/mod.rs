//! Brute-force throttling for gateway-secret checks.

pub mod rate_limit;

pub use rate_limit::{AuthThrottle, RateLimiter};
