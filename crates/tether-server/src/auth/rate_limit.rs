//! Sliding-window limiter for failed gateway-secret attempts.
//!
//! Only failures are recorded, so a legitimate peer that reconnects often is
//! never throttled, while repeated guessing from one address is.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// Per-key tracking: key → attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Whether another attempt is allowed for `key` right now.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(attempts) => {
                let active = attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count();
                (active as u32) < self.max_attempts
            }
            None => true,
        }
    }

    /// Record one attempt for `key`.
    pub fn record(&mut self, key: &str) {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);
        attempts.push(now);
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Throttle for gateway-secret failures, keyed by remote address.
#[derive(Debug)]
pub struct AuthThrottle {
    failures: RateLimiter,
}

impl AuthThrottle {
    pub fn new(max_failures: u32, window_secs: u64) -> Self {
        Self {
            failures: RateLimiter::new(max_failures, window_secs),
        }
    }

    /// Whether `ip` may attempt to authenticate.
    pub fn allows(&self, ip: &IpAddr) -> bool {
        self.failures.check(&ip.to_string())
    }

    pub fn record_failure(&mut self, ip: &IpAddr) {
        self.failures.record(&ip.to_string());
    }

    pub fn gc(&mut self) {
        self.failures.gc();
    }
}
