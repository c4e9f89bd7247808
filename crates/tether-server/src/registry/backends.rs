//! Registry of backends that dialed in to the gateway.
//!
//! Entries are keyed by backend id, which is derived from the device id, so a
//! restarted backend lands on the same entry it had before. A closed transport
//! only flags its entry offline; the sweeper removes it after a grace period.

use crate::transport::PeerHandle;
use std::collections::HashMap;
use std::time::Duration;
use tether_core::identity::short;
use tether_core::{backend_id_for_device, BackendSummary, SecretVerifier, TetherError, TetherResult};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A backend known to the gateway.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub backend_id: String,
    pub name: String,
    pub device_id: String,
    /// Outbound handle of the most recent transport.
    pub peer: PeerHandle,
    pub online: bool,
    pub registered_at: Instant,
    pub offline_since: Option<Instant>,
}

/// Outcome of a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub backend_id: String,
    /// Previous transport for the same device, still open. The caller closes it.
    pub superseded: Option<PeerHandle>,
}

/// Registry of backends, guarded by the registration secret.
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendEntry>>,
    secret: SecretVerifier,
}

impl BackendRegistry {
    pub fn new(registration_secret: &str) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            secret: SecretVerifier::new(registration_secret),
        }
    }

    /// Register (or re-register) a device.
    ///
    /// Last register wins: an existing online transport for the same device is
    /// handed back in [`Registration::superseded`] and replaced.
    pub async fn register(
        &self,
        device_id: &str,
        secret: &str,
        name: Option<String>,
        peer: PeerHandle,
    ) -> TetherResult<Registration> {
        if !self.secret.verify(secret) {
            return Err(TetherError::AuthFailed("registration rejected".into()));
        }
        if device_id.trim().is_empty() {
            return Err(TetherError::Protocol("deviceId must not be empty".into()));
        }

        let backend_id = backend_id_for_device(device_id);
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| device_id.to_string());
        let conn_id = peer.conn_id();
        let now = Instant::now();

        let mut backends = self.backends.write().await;
        let superseded = match backends.get(&backend_id) {
            Some(prev) if prev.device_id != device_id => {
                warn!(backend_id = %backend_id, "backend id collision between devices");
                return Err(TetherError::AuthFailed("registration rejected".into()));
            }
            Some(prev) if prev.online && prev.peer.conn_id() != conn_id => Some(prev.peer.clone()),
            _ => None,
        };

        backends.insert(
            backend_id.clone(),
            BackendEntry {
                backend_id: backend_id.clone(),
                name: name.clone(),
                device_id: device_id.to_string(),
                peer,
                online: true,
                registered_at: now,
                offline_since: None,
            },
        );
        drop(backends);

        info!(
            backend_id = %backend_id,
            device = %short(device_id),
            name = %name,
            conn_id,
            replaced = superseded.is_some(),
            "backend registered"
        );

        Ok(Registration {
            backend_id,
            superseded,
        })
    }

    /// Snapshot of one backend.
    pub async fn lookup(&self, backend_id: &str) -> Option<BackendEntry> {
        self.backends.read().await.get(backend_id).cloned()
    }

    /// Outbound handle of a backend, only if it is online.
    pub async fn online_peer(&self, backend_id: &str) -> Option<PeerHandle> {
        self.backends
            .read()
            .await
            .get(backend_id)
            .filter(|e| e.online)
            .map(|e| e.peer.clone())
    }

    /// All known backends, online first, then by name.
    pub async fn list(&self) -> Vec<BackendSummary> {
        let backends = self.backends.read().await;
        let mut list: Vec<BackendSummary> = backends
            .values()
            .map(|e| BackendSummary {
                backend_id: e.backend_id.clone(),
                name: e.name.clone(),
                online: e.online,
            })
            .collect();
        list.sort_by(|a, b| b.online.cmp(&a.online).then_with(|| a.name.cmp(&b.name)));
        list
    }

    /// Flag a backend offline if `conn_id` is still its current transport.
    ///
    /// Returns `true` when the entry actually went from online to offline.
    pub async fn mark_offline(&self, backend_id: &str, conn_id: u64) -> bool {
        let mut backends = self.backends.write().await;
        match backends.get_mut(backend_id) {
            Some(entry) if entry.online && entry.peer.conn_id() == conn_id => {
                entry.online = false;
                entry.offline_since = Some(Instant::now());
                info!(backend_id = %backend_id, conn_id, "backend offline");
                true
            }
            Some(_) => {
                debug!(backend_id = %backend_id, conn_id, "stale transport closed, entry untouched");
                false
            }
            None => false,
        }
    }

    /// Remove a backend entirely.
    pub async fn unregister(&self, backend_id: &str) -> Option<BackendEntry> {
        let mut backends = self.backends.write().await;
        Self::remove_entry(&mut backends, backend_id)
    }

    /// Unregister backends that have been offline longer than `grace`.
    pub async fn sweep_offline(&self, grace: Duration) -> Vec<String> {
        let mut backends = self.backends.write().await;
        let expired: Vec<String> = backends
            .values()
            .filter(|e| !e.online && e.offline_since.is_some_and(|since| since.elapsed() > grace))
            .map(|e| e.backend_id.clone())
            .collect();

        // Scan and removal share one write lock: a re-registered entry stays.
        for backend_id in &expired {
            Self::remove_entry(&mut backends, backend_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept offline backends");
        }
        expired
    }

    fn remove_entry(
        backends: &mut HashMap<String, BackendEntry>,
        backend_id: &str,
    ) -> Option<BackendEntry> {
        let removed = backends.remove(backend_id);
        if removed.is_some() {
            debug!(backend_id = %backend_id, "backend unregistered");
        }
        removed
    }

    pub async fn count_online(&self) -> usize {
        self.backends.read().await.values().filter(|e| e.online).count()
    }
}
