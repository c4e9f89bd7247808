//! Registry of connected clients and their authorization state.
//!
//! Two gates per client: gateway admission (the shared admission secret) and
//! a per-backend authorization that only the backend itself can grant.
//!
//! Every backend link records the `conn_id` of the backend transport it went
//! through, so tearing down a superseded transport leaves links made with its
//! successor alone.

use crate::transport::PeerHandle;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tether_core::{new_client_id, SecretVerifier, TetherError, TetherResult};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// One client transport.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub client_id: String,
    pub remote: IpAddr,
    pub peer: PeerHandle,
    pub gateway_authenticated: bool,
    /// Most recent `connect_backend` target and its transport.
    pub selected_backend: Option<(String, u64)>,
    /// Backends that accepted this client's API key, by transport.
    pub authorized: HashMap<String, u64>,
    /// Backends asked to verify a key.
    pub pending_auth: HashMap<String, PendingAuth>,
    pub connected_at: Instant,
}

/// An API key awaiting a backend's verdict.
#[derive(Debug, Clone, Copy)]
pub struct PendingAuth {
    pub conn_id: u64,
    pub started: Instant,
}

impl ClientEntry {
    /// Drop every link to `backend_id` made through transport `conn_id`.
    /// Returns whether there was one.
    fn release(&mut self, backend_id: &str, conn_id: u64) -> bool {
        let selected = self
            .selected_backend
            .as_ref()
            .is_some_and(|(id, conn)| id == backend_id && *conn == conn_id);
        let authorized = self.authorized.get(backend_id) == Some(&conn_id);
        let pending = self
            .pending_auth
            .get(backend_id)
            .is_some_and(|p| p.conn_id == conn_id);

        if selected {
            self.selected_backend = None;
        }
        if authorized {
            self.authorized.remove(backend_id);
        }
        if pending {
            self.pending_auth.remove(backend_id);
        }
        selected || authorized || pending
    }
}

/// Registry of clients, guarded by the admission secret.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientEntry>>,
    secret: SecretVerifier,
}

impl ClientRegistry {
    pub fn new(admission_secret: &str) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            secret: SecretVerifier::new(admission_secret),
        }
    }

    /// Record a new transport and hand out its client id. Not yet admitted.
    pub async fn connect(&self, remote: IpAddr, peer: PeerHandle) -> String {
        let client_id = new_client_id();
        let entry = ClientEntry {
            client_id: client_id.clone(),
            remote,
            peer,
            gateway_authenticated: false,
            selected_backend: None,
            authorized: HashMap::new(),
            pending_auth: HashMap::new(),
            connected_at: Instant::now(),
        };
        self.clients.write().await.insert(client_id.clone(), entry);
        debug!(client_id = %client_id, remote = %remote, "client connected");
        client_id
    }

    /// Check the admission secret and mark the client gateway-authenticated.
    pub async fn admit(&self, client_id: &str, secret: &str) -> TetherResult<()> {
        let ok = self.secret.verify(secret);
        let mut clients = self.clients.write().await;
        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| TetherError::NotFound(format!("client {client_id}")))?;
        if !ok {
            return Err(TetherError::AuthFailed("gateway authentication failed".into()));
        }
        entry.gateway_authenticated = true;
        info!(client_id = %client_id, "client admitted");
        Ok(())
    }

    pub async fn is_admitted(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|e| e.gateway_authenticated)
    }

    pub async fn peer(&self, client_id: &str) -> Option<PeerHandle> {
        self.clients.read().await.get(client_id).map(|e| e.peer.clone())
    }

    pub async fn remote(&self, client_id: &str) -> Option<IpAddr> {
        self.clients.read().await.get(client_id).map(|e| e.remote)
    }

    /// Select a backend, reached through transport `conn_id`, and mark its
    /// authorization as pending.
    ///
    /// Any earlier verdict for the same backend is discarded; the new key
    /// decides.
    pub async fn select_backend(
        &self,
        client_id: &str,
        backend_id: &str,
        conn_id: u64,
    ) -> TetherResult<()> {
        let mut clients = self.clients.write().await;
        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| TetherError::NotFound(format!("client {client_id}")))?;
        entry.selected_backend = Some((backend_id.to_string(), conn_id));
        entry.authorized.remove(backend_id);
        entry.pending_auth.insert(
            backend_id.to_string(),
            PendingAuth {
                conn_id,
                started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Drop a pending authorization without a verdict (e.g. the send failed).
    pub async fn cancel_pending(&self, client_id: &str, backend_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.pending_auth.remove(backend_id);
        }
    }

    /// Apply a verdict that arrived over backend transport `conn_id`.
    ///
    /// Returns the client's handle when a matching request was pending on
    /// that transport, `None` for unknown clients or unsolicited verdicts.
    pub async fn on_auth_result(
        &self,
        client_id: &str,
        backend_id: &str,
        conn_id: u64,
        success: bool,
    ) -> Option<PeerHandle> {
        let mut clients = self.clients.write().await;
        let entry = clients.get_mut(client_id)?;
        if entry.pending_auth.get(backend_id)?.conn_id != conn_id {
            return None;
        }
        entry.pending_auth.remove(backend_id);
        if success {
            entry.authorized.insert(backend_id.to_string(), conn_id);
        }
        Some(entry.peer.clone())
    }

    pub async fn is_authorized(&self, client_id: &str, backend_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|e| e.gateway_authenticated && e.authorized.contains_key(backend_id))
    }

    /// Handle of a client, only if it is authorized for `backend_id`.
    pub async fn authorized_peer(&self, client_id: &str, backend_id: &str) -> Option<PeerHandle> {
        self.clients
            .read()
            .await
            .get(client_id)
            .filter(|e| e.authorized.contains_key(backend_id))
            .map(|e| e.peer.clone())
    }

    /// Ids of clients currently authorized for `backend_id`.
    pub async fn holders_of(&self, backend_id: &str) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .filter(|e| e.authorized.contains_key(backend_id))
            .map(|e| e.client_id.clone())
            .collect()
    }

    /// Forget every client's link to a backend transport that went away.
    ///
    /// Only links made through `conn_id` are dropped. Returns the handles of
    /// affected clients, each exactly once.
    pub async fn revoke_backend(&self, backend_id: &str, conn_id: u64) -> Vec<(String, PeerHandle)> {
        let mut clients = self.clients.write().await;
        let mut affected = Vec::new();
        for entry in clients.values_mut() {
            if entry.release(backend_id, conn_id) {
                affected.push((entry.client_id.clone(), entry.peer.clone()));
            }
        }
        affected
    }

    /// Fail authorization requests that have waited longer than `timeout`.
    pub async fn expire_pending_auth(&self, timeout: Duration) -> Vec<(String, PeerHandle)> {
        let mut clients = self.clients.write().await;
        let mut expired = Vec::new();
        for entry in clients.values_mut() {
            let stale: Vec<String> = entry
                .pending_auth
                .iter()
                .filter(|(_, pending)| pending.started.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for backend_id in stale {
                entry.pending_auth.remove(&backend_id);
                expired.push((backend_id, entry.peer.clone()));
            }
        }
        expired
    }

    /// Remove a client, returning its final state.
    pub async fn remove(&self, client_id: &str) -> Option<ClientEntry> {
        let removed = self.clients.write().await.remove(client_id);
        if removed.is_some() {
            debug!(client_id = %client_id, "client removed");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const CONN: u64 = 7;

    async fn admitted(reg: &ClientRegistry) -> String {
        let id = reg.connect(LOCAL, PeerHandle::channel(1, 8).0).await;
        reg.admit(&id, "S").await.unwrap();
        id
    }

    #[tokio::test]
    async fn admit_checks_secret() {
        let reg = ClientRegistry::new("S");
        let id = reg.connect(LOCAL, PeerHandle::channel(1, 8).0).await;
        assert!(!reg.is_admitted(&id).await);
        assert!(matches!(
            reg.admit(&id, "wrong").await,
            Err(TetherError::AuthFailed(_))
        ));
        assert!(!reg.is_admitted(&id).await);
        reg.admit(&id, "S").await.unwrap();
        assert!(reg.is_admitted(&id).await);
    }

    #[tokio::test]
    async fn client_ids_are_unique_per_transport() {
        let reg = ClientRegistry::new("S");
        let a = reg.connect(LOCAL, PeerHandle::channel(1, 8).0).await;
        let b = reg.connect(LOCAL, PeerHandle::channel(2, 8).0).await;
        assert_ne!(a, b);
        assert_eq!(reg.count().await, 2);
    }

    #[tokio::test]
    async fn auth_result_requires_pending_request() {
        let reg = ClientRegistry::new("S");
        let id = admitted(&reg).await;
        assert!(reg.on_auth_result(&id, "backend_x", CONN, true).await.is_none());
        assert!(!reg.is_authorized(&id, "backend_x").await);

        reg.select_backend(&id, "backend_x", CONN).await.unwrap();
        assert!(reg.on_auth_result(&id, "backend_x", CONN, true).await.is_some());
        assert!(reg.is_authorized(&id, "backend_x").await);
    }

    #[tokio::test]
    async fn failed_verdict_leaves_pair_unauthorized() {
        let reg = ClientRegistry::new("S");
        let id = admitted(&reg).await;
        reg.select_backend(&id, "backend_x", CONN).await.unwrap();
        assert!(reg.on_auth_result(&id, "backend_x", CONN, false).await.is_some());
        assert!(!reg.is_authorized(&id, "backend_x").await);
        assert!(reg.authorized_peer(&id, "backend_x").await.is_none());
    }

    #[tokio::test]
    async fn revoke_reports_each_holder_once() {
        let reg = ClientRegistry::new("S");
        let a = admitted(&reg).await;
        let b = admitted(&reg).await;
        let c = admitted(&reg).await;
        for id in [&a, &b] {
            reg.select_backend(id, "backend_x", CONN).await.unwrap();
            reg.on_auth_result(id, "backend_x", CONN, true).await;
        }
        reg.select_backend(&c, "backend_y", CONN).await.unwrap();

        let mut revoked: Vec<String> = reg
            .revoke_backend("backend_x", CONN)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        revoked.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(revoked, expected);

        assert!(reg.revoke_backend("backend_x", CONN).await.is_empty());
        assert!(!reg.is_authorized(&a, "backend_x").await);
        assert!(reg.holders_of("backend_x").await.is_empty());
    }

    #[tokio::test]
    async fn revoke_spares_links_to_newer_transport() {
        let reg = ClientRegistry::new("S");
        let old = admitted(&reg).await;
        let new = admitted(&reg).await;
        reg.select_backend(&old, "backend_x", 1).await.unwrap();
        reg.on_auth_result(&old, "backend_x", 1, true).await.unwrap();
        reg.select_backend(&new, "backend_x", 2).await.unwrap();

        let revoked: Vec<String> = reg
            .revoke_backend("backend_x", 1)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(revoked, vec![old.clone()]);
        assert!(!reg.is_authorized(&old, "backend_x").await);

        // The pending request on the newer transport is still answerable.
        assert!(reg.on_auth_result(&new, "backend_x", 2, true).await.is_some());
        assert!(reg.is_authorized(&new, "backend_x").await);
    }

    #[tokio::test]
    async fn verdict_from_other_transport_is_unsolicited() {
        let reg = ClientRegistry::new("S");
        let id = admitted(&reg).await;
        reg.select_backend(&id, "backend_x", 2).await.unwrap();
        assert!(reg.on_auth_result(&id, "backend_x", 1, true).await.is_none());
        assert!(!reg.is_authorized(&id, "backend_x").await);
    }

    #[tokio::test]
    async fn holders_are_authorized_clients_only() {
        let reg = ClientRegistry::new("S");
        let a = admitted(&reg).await;
        let b = admitted(&reg).await;
        reg.select_backend(&a, "backend_x", CONN).await.unwrap();
        reg.on_auth_result(&a, "backend_x", CONN, true).await;
        reg.select_backend(&b, "backend_x", CONN).await.unwrap();
        assert_eq!(reg.holders_of("backend_x").await, vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_auth_expires() {
        let reg = ClientRegistry::new("S");
        let id = admitted(&reg).await;
        reg.select_backend(&id, "backend_x", CONN).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(reg.expire_pending_auth(Duration::from_secs(30)).await.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let expired = reg.expire_pending_auth(Duration::from_secs(30)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "backend_x");
        assert!(reg.on_auth_result(&id, "backend_x", CONN, true).await.is_none());
    }
}
