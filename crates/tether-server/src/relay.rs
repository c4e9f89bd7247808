//! Relay engine: routes traffic between clients and backends.
//!
//! The engine owns both registries, the tunnel correlation table and the auth
//! throttle. Connection tasks feed it decoded frames and act on the returned
//! [`Flow`]; everything the engine sends goes out through [`PeerHandle`]s, so
//! no lock is ever held across socket I/O.

use crate::auth::AuthThrottle;
use crate::config::GatewayConfig;
use crate::registry::{BackendRegistry, ClientRegistry};
use crate::transport::{PeerHandle, PeerOutbox};
use crate::tunnel::PendingRequests;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_core::codec::peek_type;
use tether_core::identity::short;
use tether_core::messages::{FromBackend, FromClient, ToBackend, ToClient};
use tether_core::{
    backend_id_for_device, decode, new_request_id, ErrorCode, HttpProxyRequest,
    HttpProxyResponse, TetherError, TetherResult,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the connection task should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush queued frames, then close the transport.
    Close,
}

/// Per-connection state of a backend transport.
#[derive(Debug)]
pub struct BackendSession {
    remote: IpAddr,
    peer: PeerHandle,
    backend_id: Option<String>,
}

impl BackendSession {
    pub fn new(remote: IpAddr, peer: PeerHandle) -> Self {
        Self {
            remote,
            peer,
            backend_id: None,
        }
    }

    /// Backend id confirmed by a successful `register`.
    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    pub fn conn_id(&self) -> u64 {
        self.peer.conn_id()
    }
}

/// An HTTP call to tunnel to a backend.
#[derive(Debug, Clone, Default)]
pub struct HttpCall {
    pub method: String,
    /// Path plus query string.
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayStats {
    pub backends_online: usize,
    pub clients: usize,
    pub pending_http: usize,
}

/// The gateway's routing core.
pub struct RelayEngine {
    backends: BackendRegistry,
    clients: ClientRegistry,
    pending: PendingRequests,
    throttle: Mutex<AuthThrottle>,
    http_timeout: Duration,
    backend_auth_timeout: Duration,
    offline_grace: Duration,
    outbound_queue: usize,
    next_conn_id: AtomicU64,
}

impl RelayEngine {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            backends: BackendRegistry::new(&config.registration_secret),
            clients: ClientRegistry::new(&config.admission_secret),
            pending: PendingRequests::new(),
            throttle: Mutex::new(AuthThrottle::new(config.auth_failures_per_minute, 60)),
            http_timeout: config.http_timeout,
            backend_auth_timeout: config.backend_auth_timeout,
            offline_grace: config.offline_grace,
            outbound_queue: config.outbound_queue,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate the outbound queue for a freshly accepted transport.
    pub fn open_peer(&self) -> (PeerHandle, PeerOutbox) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        PeerHandle::channel(conn_id, self.outbound_queue)
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            backends_online: self.backends.count_online().await,
            clients: self.clients.count().await,
            pending_http: self.pending.len().await,
        }
    }

    // ── Client side ──────────────────────────────────────────────────

    /// Register a new client transport. The client still has to authenticate.
    pub async fn attach_client(&self, remote: IpAddr, peer: PeerHandle) -> String {
        self.clients.connect(remote, peer).await
    }

    /// Handle one text frame from a client.
    pub async fn handle_client_frame(&self, client_id: &str, text: &str) -> Flow {
        let Some(peer) = self.clients.peer(client_id).await else {
            return Flow::Close;
        };

        let msg: FromClient = match decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client_id = %client_id, kind = ?peek_type(text), error = %e, "malformed client frame dropped");
                let _ = peer.send(&ToClient::error(ErrorCode::ProtocolError, e.to_string(), None));
                return Flow::Continue;
            }
        };

        if let FromClient::GatewayAuth { gateway_secret } = &msg {
            return self.admit_client(client_id, &peer, gateway_secret).await;
        }

        if !self.clients.is_admitted(client_id).await {
            debug!(client_id = %client_id, "frame before gateway auth rejected");
            let _ = peer.send(&ToClient::error(
                ErrorCode::NotAuthenticated,
                "authenticate with gateway_auth first",
                None,
            ));
            return Flow::Continue;
        }

        match msg {
            FromClient::GatewayAuth { .. } => {}
            FromClient::ListBackends {} => {
                let backends = self.backends.list().await;
                let _ = peer.send(&ToClient::BackendsList { backends });
            }
            FromClient::ConnectBackend { backend_id, api_key } => {
                self.connect_backend(client_id, &peer, &backend_id, api_key).await;
            }
            FromClient::SendToBackend { backend_id, message } => {
                self.send_to_backend(client_id, &peer, &backend_id, message).await;
            }
        }
        Flow::Continue
    }

    async fn admit_client(&self, client_id: &str, peer: &PeerHandle, secret: &str) -> Flow {
        let Some(remote) = self.clients.remote(client_id).await else {
            return Flow::Close;
        };

        if !self.throttle.lock().await.allows(&remote) {
            warn!(client_id = %client_id, remote = %remote, "gateway auth throttled");
            let _ = peer.send(&ToClient::error(
                ErrorCode::RateLimited,
                "too many failed attempts",
                None,
            ));
            return Flow::Close;
        }

        match self.clients.admit(client_id, secret).await {
            Ok(()) => {
                let _ = peer.send(&ToClient::GatewayAuthResult {
                    success: true,
                    error: None,
                    client_id: Some(client_id.to_string()),
                });
                Flow::Continue
            }
            Err(e) => {
                self.throttle.lock().await.record_failure(&remote);
                warn!(client_id = %client_id, remote = %remote, error = %e, "gateway auth failed");
                let _ = peer.send(&ToClient::GatewayAuthResult {
                    success: false,
                    error: Some("authentication failed".into()),
                    client_id: None,
                });
                Flow::Close
            }
        }
    }

    async fn connect_backend(
        &self,
        client_id: &str,
        peer: &PeerHandle,
        backend_id: &str,
        api_key: String,
    ) {
        let Some(entry) = self.backends.lookup(backend_id).await else {
            let _ = peer.send(&ToClient::auth_failed(backend_id, "backend not found"));
            return;
        };
        if !entry.online {
            let _ = peer.send(&ToClient::auth_failed(backend_id, "backend offline"));
            return;
        }
        if self
            .clients
            .select_backend(client_id, backend_id, entry.peer.conn_id())
            .await
            .is_err()
        {
            return;
        }

        let request = ToBackend::ClientAuth {
            client_id: client_id.to_string(),
            api_key,
        };
        match entry.peer.send(&request) {
            Ok(()) => debug!(client_id = %client_id, backend_id = %backend_id, "client auth forwarded"),
            Err(e) => {
                warn!(client_id = %client_id, backend_id = %backend_id, error = %e, "client auth not delivered");
                self.clients.cancel_pending(client_id, backend_id).await;
                let _ = peer.send(&ToClient::auth_failed(backend_id, "backend unreachable"));
            }
        }
    }

    async fn send_to_backend(
        &self,
        client_id: &str,
        peer: &PeerHandle,
        backend_id: &str,
        message: Value,
    ) {
        let reject = |code: ErrorCode, text: &str| {
            let _ = peer.send(&ToClient::error(code, text, Some(backend_id)));
        };

        let Some(entry) = self.backends.lookup(backend_id).await else {
            return reject(ErrorCode::BackendNotFound, "backend not found");
        };
        if !entry.online {
            return reject(ErrorCode::BackendOffline, "backend offline");
        }
        if !self.clients.is_authorized(client_id, backend_id).await {
            return reject(
                ErrorCode::BackendNotAuthenticated,
                "connect_backend must succeed first",
            );
        }

        let forwarded = ToBackend::Forwarded {
            client_id: client_id.to_string(),
            message,
        };
        match entry.peer.send(&forwarded) {
            Ok(()) => debug!(client_id = %client_id, backend_id = %backend_id, "message forwarded"),
            Err(_) => reject(ErrorCode::BackendOffline, "backend unreachable"),
        }
    }

    /// Forget a client whose transport closed and tell its backends.
    pub async fn detach_client(&self, client_id: &str) {
        let Some(entry) = self.clients.remove(client_id).await else {
            return;
        };
        for backend_id in entry.authorized.keys() {
            if let Some(backend) = self.backends.online_peer(backend_id).await {
                let _ = backend.send(&ToBackend::ClientDisconnected {
                    client_id: client_id.to_string(),
                });
            }
        }
        info!(
            client_id = %short(client_id),
            backends = entry.authorized.len(),
            "client disconnected"
        );
    }

    // ── Backend side ─────────────────────────────────────────────────

    /// Handle one text frame from a backend transport.
    pub async fn handle_backend_frame(&self, session: &mut BackendSession, text: &str) -> Flow {
        let msg: FromBackend = match decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn_id = session.conn_id(), kind = ?peek_type(text), error = %e, "malformed backend frame dropped");
                return Flow::Continue;
            }
        };

        match (msg, session.backend_id.clone()) {
            (
                FromBackend::Register {
                    gateway_secret,
                    device_id,
                    name,
                },
                _,
            ) => {
                self.register_backend(session, &gateway_secret, &device_id, name)
                    .await
            }
            (_, None) => {
                warn!(conn_id = session.conn_id(), "frame before register dropped");
                Flow::Continue
            }
            (msg, Some(backend_id)) => {
                if !self.is_current(session, &backend_id).await {
                    debug!(backend_id = %backend_id, conn_id = session.conn_id(), "frame from stale transport dropped");
                    return Flow::Continue;
                }
                self.route_from_backend(session, &backend_id, msg).await;
                Flow::Continue
            }
        }
    }

    async fn is_current(&self, session: &BackendSession, backend_id: &str) -> bool {
        self.backends
            .online_peer(backend_id)
            .await
            .is_some_and(|p| p.conn_id() == session.conn_id())
    }

    async fn register_backend(
        &self,
        session: &mut BackendSession,
        secret: &str,
        device_id: &str,
        name: Option<String>,
    ) -> Flow {
        let reply = |success: bool, backend_id: Option<String>, error: Option<String>| {
            let _ = session.peer.send(&ToBackend::RegisterResult {
                success,
                backend_id,
                error,
            });
        };

        if !self.throttle.lock().await.allows(&session.remote) {
            warn!(remote = %session.remote, "backend registration throttled");
            reply(false, None, Some(ErrorCode::RateLimited.to_string()));
            return Flow::Close;
        }

        if let Some(current) = session.backend_id.as_deref() {
            if current != backend_id_for_device(device_id) {
                warn!(backend_id = %current, "connection tried to register a second device");
                reply(false, None, Some("connection already registered".into()));
                return Flow::Continue;
            }
        }

        match self
            .backends
            .register(device_id, secret, name, session.peer.clone())
            .await
        {
            Ok(registration) => {
                if let Some(old) = registration.superseded {
                    debug!(backend_id = %registration.backend_id, old_conn = old.conn_id(), "closing superseded transport");
                    old.close();
                    self.drop_backend_links(&registration.backend_id, old.conn_id())
                        .await;
                }
                reply(true, Some(registration.backend_id.clone()), None);
                session.backend_id = Some(registration.backend_id);
                Flow::Continue
            }
            Err(TetherError::AuthFailed(e)) => {
                self.throttle.lock().await.record_failure(&session.remote);
                warn!(remote = %session.remote, error = %e, "backend registration rejected");
                reply(false, None, Some("registration rejected".into()));
                Flow::Close
            }
            Err(e) => {
                warn!(remote = %session.remote, error = %e, "invalid registration");
                reply(false, None, Some(e.to_string()));
                Flow::Continue
            }
        }
    }

    async fn route_from_backend(&self, session: &BackendSession, backend_id: &str, msg: FromBackend) {
        match msg {
            FromBackend::Register { .. } => {}
            FromBackend::ClientAuthResult {
                client_id,
                success,
                error,
            } => {
                let Some(client) = self
                    .clients
                    .on_auth_result(&client_id, backend_id, session.conn_id(), success)
                    .await
                else {
                    debug!(client_id = %client_id, backend_id = %backend_id, "unsolicited auth verdict dropped");
                    return;
                };
                let error = match success {
                    true => None,
                    false => Some(error.unwrap_or_else(|| "authentication failed".into())),
                };
                let _ = client.send(&ToClient::BackendAuthResult {
                    backend_id: backend_id.to_string(),
                    success,
                    error,
                });
                if success {
                    info!(client_id = %short(&client_id), backend_id = %backend_id, "client authorized");
                    let _ = session.peer.send(&ToBackend::ClientConnected { client_id });
                }
            }
            FromBackend::BackendResponse { client_id, message } => {
                match self.clients.authorized_peer(&client_id, backend_id).await {
                    Some(client) => {
                        let _ = client.send(&ToClient::BackendMessage {
                            backend_id: backend_id.to_string(),
                            message,
                        });
                    }
                    None => {
                        debug!(client_id = %client_id, backend_id = %backend_id, "response for unknown client dropped")
                    }
                }
            }
            FromBackend::HttpProxyResponse(response) => {
                let request_id = response.request_id.clone();
                if !self.pending.complete(backend_id, response).await {
                    warn!(request_id = %request_id, backend_id = %backend_id, "unknown tunnel response dropped");
                }
            }
        }
    }

    /// Flag a backend offline after its transport closed.
    pub async fn detach_backend(&self, session: &BackendSession) {
        let Some(backend_id) = session.backend_id() else {
            return;
        };
        if self.backends.mark_offline(backend_id, session.conn_id()).await {
            self.drop_backend_links(backend_id, session.conn_id()).await;
        }
    }

    /// Clear every client pair and fail every tunnel call that went through a
    /// backend transport which is gone.
    async fn drop_backend_links(&self, backend_id: &str, conn_id: u64) {
        let affected = self.clients.revoke_backend(backend_id, conn_id).await;
        for (_, client) in &affected {
            let _ = client.send(&ToClient::BackendDisconnected {
                backend_id: backend_id.to_string(),
            });
        }
        let failed = self.pending.fail_backend(backend_id, conn_id).await;
        info!(
            backend_id = %backend_id,
            conn_id,
            clients = affected.len(),
            pending_http = failed,
            "backend links dropped"
        );
    }

    // ── HTTP tunnel ──────────────────────────────────────────────────

    /// Tunnel an HTTP call to a backend on behalf of an authorized client.
    ///
    /// `timeout` defaults to the configured tunnel timeout. A call that times
    /// out is removed from the correlation table; a late response is dropped.
    pub async fn proxy_http(
        &self,
        client_id: &str,
        backend_id: &str,
        call: HttpCall,
        timeout: Option<Duration>,
    ) -> TetherResult<HttpProxyResponse> {
        let entry = self
            .backends
            .lookup(backend_id)
            .await
            .ok_or_else(|| TetherError::NotFound(format!("backend {backend_id}")))?;
        if !entry.online {
            return Err(TetherError::Transport(format!("backend {backend_id} offline")));
        }
        if !self.clients.is_authorized(client_id, backend_id).await {
            return Err(TetherError::AuthFailed("client not authorized for backend".into()));
        }

        let timeout = timeout.unwrap_or(self.http_timeout);
        let request_id = new_request_id();
        let rx = self
            .pending
            .insert(
                &request_id,
                client_id,
                backend_id,
                entry.peer.conn_id(),
                Instant::now() + timeout,
            )
            .await?;

        let request = ToBackend::HttpProxyRequest(HttpProxyRequest {
            request_id: request_id.clone(),
            method: call.method,
            path: call.path,
            headers: call.headers,
            body: call.body,
        });
        if let Err(e) = entry.peer.send(&request) {
            self.pending.remove(&request_id).await;
            return Err(e);
        }
        debug!(request_id = %request_id, backend_id = %backend_id, "tunnel request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TetherError::Transport("tunnel request abandoned".into())),
            Err(_) => {
                self.pending.remove(&request_id).await;
                warn!(
                    request_id = %request_id,
                    backend_id = %backend_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "tunnel request timed out"
                );
                Err(TetherError::Timeout)
            }
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────────

    /// Periodic cleanup: expired offline backends, unanswered backend auth,
    /// orphaned tunnel calls and stale throttle entries.
    pub async fn sweep(&self) {
        for backend_id in self.backends.sweep_offline(self.offline_grace).await {
            info!(backend_id = %backend_id, "offline backend expired");
        }

        for (backend_id, client) in self.clients.expire_pending_auth(self.backend_auth_timeout).await {
            debug!(backend_id = %backend_id, "backend auth timed out");
            let _ = client.send(&ToClient::auth_failed(&backend_id, "backend did not respond"));
        }

        let expired = self.pending.sweep_expired().await;
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired tunnel requests swept");
        }

        self.throttle.lock().await.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const SECRET: &str = "S";
    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn engine() -> Arc<RelayEngine> {
        Arc::new(RelayEngine::new(&GatewayConfig::local(SECRET)))
    }

    fn drain<T: DeserializeOwned>(outbox: &mut PeerOutbox) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(frame) = outbox.frames.try_recv() {
            out.push(decode(&frame).unwrap());
        }
        out
    }

    async fn backend(engine: &RelayEngine, device_id: &str) -> (BackendSession, PeerOutbox) {
        let (peer, mut outbox) = engine.open_peer();
        let mut session = BackendSession::new(LOCAL, peer);
        let register = json!({"type": "register", "gatewaySecret": SECRET, "deviceId": device_id});
        let flow = engine
            .handle_backend_frame(&mut session, &register.to_string())
            .await;
        assert_eq!(flow, Flow::Continue);
        let replies: Vec<ToBackend> = drain(&mut outbox);
        assert!(matches!(
            replies.as_slice(),
            [ToBackend::RegisterResult { success: true, .. }]
        ));
        (session, outbox)
    }

    async fn client(engine: &RelayEngine) -> (String, PeerOutbox) {
        let (peer, mut outbox) = engine.open_peer();
        let client_id = engine.attach_client(LOCAL, peer).await;
        let auth = json!({"type": "gateway_auth", "gatewaySecret": SECRET});
        assert_eq!(
            engine.handle_client_frame(&client_id, &auth.to_string()).await,
            Flow::Continue
        );
        let replies: Vec<ToClient> = drain(&mut outbox);
        assert_eq!(
            replies,
            vec![ToClient::GatewayAuthResult {
                success: true,
                error: None,
                client_id: Some(client_id.clone()),
            }]
        );
        (client_id, outbox)
    }

    async fn connect(engine: &RelayEngine, client_id: &str, backend_id: &str) {
        let frame = json!({"type": "connect_backend", "backendId": backend_id, "apiKey": "k"});
        engine.handle_client_frame(client_id, &frame.to_string()).await;
    }

    async fn verdict(engine: &RelayEngine, session: &mut BackendSession, client_id: &str, ok: bool) {
        let frame = json!({"type": "client_auth_result", "clientId": client_id, "success": ok});
        engine.handle_backend_frame(session, &frame.to_string()).await;
    }

    /// Full handshake: connect_backend, backend accepts.
    async fn authorize(
        engine: &RelayEngine,
        client_id: &str,
        client_out: &mut PeerOutbox,
        session: &mut BackendSession,
        backend_out: &mut PeerOutbox,
    ) {
        let backend_id = session.backend_id().unwrap().to_string();
        connect(engine, client_id, &backend_id).await;
        let asked: Vec<ToBackend> = drain(backend_out);
        assert_eq!(
            asked,
            vec![ToBackend::ClientAuth {
                client_id: client_id.into(),
                api_key: "k".into()
            }]
        );
        verdict(engine, session, client_id, true).await;
        let got: Vec<ToClient> = drain(client_out);
        assert_eq!(
            got,
            vec![ToClient::BackendAuthResult {
                backend_id,
                success: true,
                error: None
            }]
        );
        let connected: Vec<ToBackend> = drain(backend_out);
        assert_eq!(
            connected,
            vec![ToBackend::ClientConnected {
                client_id: client_id.into()
            }]
        );
    }

    #[tokio::test]
    async fn restart_keeps_backend_id_and_accepts_stale_reference() {
        let engine = engine();
        let (mut old, mut old_out) = backend(&engine, "dev-1").await;
        let (client_id, mut client_out) = client(&engine).await;
        authorize(&engine, &client_id, &mut client_out, &mut old, &mut old_out).await;
        let backend_id = old.backend_id().unwrap().to_string();

        // Backend restarts and registers again before the old close is seen.
        let (mut new, mut new_out) = backend(&engine, "dev-1").await;
        assert_eq!(new.backend_id(), Some(backend_id.as_str()));
        assert!(*old_out.close_rx.borrow());

        // The old transport's late close must not take the new one offline.
        engine.detach_backend(&old).await;
        assert!(engine.backends().online_peer(&backend_id).await.is_some());

        let notices: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(
            notices,
            vec![ToClient::BackendDisconnected {
                backend_id: backend_id.clone()
            }]
        );

        authorize(&engine, &client_id, &mut client_out, &mut new, &mut new_out).await;
        assert!(drain::<ToBackend>(&mut old_out).is_empty());
    }

    #[tokio::test]
    async fn superseded_cleanup_spares_links_made_with_successor() {
        let engine = engine();
        let (mut old, mut old_out) = backend(&engine, "dev-1").await;
        let (a, mut a_out) = client(&engine).await;
        authorize(&engine, &a, &mut a_out, &mut old, &mut old_out).await;
        let backend_id = old.backend_id().unwrap().to_string();

        // Successor registered, links of the old transport not yet dropped.
        let (peer, mut new_out) = engine.open_peer();
        engine
            .backends()
            .register("dev-1", SECRET, None, peer.clone())
            .await
            .unwrap();
        let mut new = BackendSession::new(LOCAL, peer);
        new.backend_id = Some(backend_id.clone());

        let (b, mut b_out) = client(&engine).await;
        connect(&engine, &b, &backend_id).await;
        assert_eq!(drain::<ToBackend>(&mut new_out).len(), 1);

        engine.drop_backend_links(&backend_id, old.conn_id()).await;
        assert_eq!(
            drain::<ToClient>(&mut a_out),
            vec![ToClient::BackendDisconnected {
                backend_id: backend_id.clone()
            }]
        );
        assert!(drain::<ToClient>(&mut b_out).is_empty());

        verdict(&engine, &mut new, &b, true).await;
        assert_eq!(
            drain::<ToClient>(&mut b_out),
            vec![ToClient::BackendAuthResult {
                backend_id: backend_id.clone(),
                success: true,
                error: None
            }]
        );
        assert!(engine.clients().is_authorized(&b, &backend_id).await);
        assert!(!engine.clients().is_authorized(&a, &backend_id).await);
    }

    #[tokio::test]
    async fn connect_to_missing_or_offline_backend_fails_locally() {
        let engine = engine();
        let (session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        engine.detach_backend(&session).await;

        let (client_id, mut client_out) = client(&engine).await;
        connect(&engine, &client_id, &backend_id).await;
        connect(&engine, &client_id, "backend_nope").await;

        let replies: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(
            replies,
            vec![
                ToClient::auth_failed(&backend_id, "backend offline"),
                ToClient::auth_failed("backend_nope", "backend not found"),
            ]
        );
        assert!(drain::<ToBackend>(&mut backend_out).is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_notifies_backend_once() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let (client_id, mut client_out) = client(&engine).await;
        authorize(&engine, &client_id, &mut client_out, &mut session, &mut backend_out).await;

        engine.detach_client(&client_id).await;
        engine.detach_client(&client_id).await;

        let notices: Vec<ToBackend> = drain(&mut backend_out);
        assert_eq!(
            notices,
            vec![ToBackend::ClientDisconnected {
                client_id: client_id.clone()
            }]
        );

        let send = json!({"type": "send_to_backend", "backendId": session.backend_id(), "message": 1});
        assert_eq!(
            engine.handle_client_frame(&client_id, &send.to_string()).await,
            Flow::Close
        );
        assert!(drain::<ToBackend>(&mut backend_out).is_empty());
    }

    #[tokio::test]
    async fn backend_disconnect_notifies_each_client_once() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (a, mut a_out) = client(&engine).await;
        let (b, mut b_out) = client(&engine).await;
        authorize(&engine, &a, &mut a_out, &mut session, &mut backend_out).await;
        authorize(&engine, &b, &mut b_out, &mut session, &mut backend_out).await;
        assert_eq!(engine.clients().holders_of(&backend_id).await.len(), 2);

        engine.detach_backend(&session).await;
        engine.detach_backend(&session).await;

        for out in [&mut a_out, &mut b_out] {
            let notices: Vec<ToClient> = drain(out);
            assert_eq!(
                notices,
                vec![ToClient::BackendDisconnected {
                    backend_id: backend_id.clone()
                }]
            );
        }

        let send = json!({"type": "send_to_backend", "backendId": backend_id, "message": "hi"});
        engine.handle_client_frame(&a, &send.to_string()).await;
        let replies: Vec<ToClient> = drain(&mut a_out);
        assert_eq!(
            replies,
            vec![ToClient::error(
                ErrorCode::BackendOffline,
                "backend offline",
                Some(&backend_id)
            )]
        );
    }

    #[tokio::test]
    async fn messages_flow_both_ways_once_authorized() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;

        let send = json!({"type": "send_to_backend", "backendId": backend_id, "message": {"q": 1}});
        engine.handle_client_frame(&client_id, &send.to_string()).await;
        let rejected: Vec<ToClient> = drain(&mut client_out);
        assert!(matches!(
            rejected.as_slice(),
            [ToClient::GatewayError { code, .. }] if code == "BACKEND_NOT_AUTHENTICATED"
        ));

        authorize(&engine, &client_id, &mut client_out, &mut session, &mut backend_out).await;
        engine.handle_client_frame(&client_id, &send.to_string()).await;
        let forwarded: Vec<ToBackend> = drain(&mut backend_out);
        assert_eq!(
            forwarded,
            vec![ToBackend::Forwarded {
                client_id: client_id.clone(),
                message: json!({"q": 1})
            }]
        );

        let reply = json!({"type": "backend_response", "clientId": client_id, "message": [1, 2]});
        engine.handle_backend_frame(&mut session, &reply.to_string()).await;
        let delivered: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(
            delivered,
            vec![ToClient::BackendMessage {
                backend_id,
                message: json!([1, 2])
            }]
        );
    }

    #[tokio::test]
    async fn rejected_key_leaves_pair_unauthorized() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;

        connect(&engine, &client_id, &backend_id).await;
        drain::<ToBackend>(&mut backend_out);
        verdict(&engine, &mut session, &client_id, false).await;

        let replies: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(
            replies,
            vec![ToClient::auth_failed(&backend_id, "authentication failed")]
        );
        assert!(drain::<ToBackend>(&mut backend_out).is_empty());
        assert!(!engine.clients().is_authorized(&client_id, &backend_id).await);
    }

    #[tokio::test]
    async fn concurrent_connects_resolve_independently() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (a, mut a_out) = client(&engine).await;
        let (b, mut b_out) = client(&engine).await;

        connect(&engine, &a, &backend_id).await;
        connect(&engine, &b, &backend_id).await;
        assert_eq!(drain::<ToBackend>(&mut backend_out).len(), 2);

        verdict(&engine, &mut session, &b, true).await;
        verdict(&engine, &mut session, &a, true).await;

        for out in [&mut a_out, &mut b_out] {
            let replies: Vec<ToClient> = drain(out);
            assert!(matches!(
                replies.as_slice(),
                [ToClient::BackendAuthResult { success: true, .. }]
            ));
        }
        assert!(engine.clients().is_authorized(&a, &backend_id).await);
        assert!(engine.clients().is_authorized(&b, &backend_id).await);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_closing() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let (client_id, mut client_out) = client(&engine).await;

        assert_eq!(
            engine.handle_client_frame(&client_id, "{not json").await,
            Flow::Continue
        );
        assert_eq!(
            engine
                .handle_client_frame(&client_id, r#"{"type":"launch_rockets"}"#)
                .await,
            Flow::Continue
        );
        let errors: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(
            e,
            ToClient::GatewayError { code, .. } if code == "PROTOCOL_ERROR"
        )));

        assert_eq!(
            engine.handle_backend_frame(&mut session, "garbage").await,
            Flow::Continue
        );
        assert!(drain::<ToBackend>(&mut backend_out).is_empty());
        assert_eq!(engine.stats().await.backends_online, 1);
        assert!(engine.clients().is_admitted(&client_id).await);
    }

    #[tokio::test]
    async fn unauthenticated_client_is_refused() {
        let engine = engine();
        let (peer, mut outbox) = engine.open_peer();
        let client_id = engine.attach_client(LOCAL, peer).await;

        let flow = engine
            .handle_client_frame(&client_id, r#"{"type":"list_backends"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        let replies: Vec<ToClient> = drain(&mut outbox);
        assert!(matches!(
            replies.as_slice(),
            [ToClient::GatewayError { code, .. }] if code == "NOT_AUTHENTICATED"
        ));

        let bad = json!({"type": "gateway_auth", "gatewaySecret": "wrong"});
        assert_eq!(
            engine.handle_client_frame(&client_id, &bad.to_string()).await,
            Flow::Close
        );
        let replies: Vec<ToClient> = drain(&mut outbox);
        assert!(matches!(
            replies.as_slice(),
            [ToClient::GatewayAuthResult { success: false, client_id: None, .. }]
        ));
    }

    #[tokio::test]
    async fn repeated_failures_are_throttled() {
        let mut config = GatewayConfig::local(SECRET);
        config.auth_failures_per_minute = 2;
        let engine = RelayEngine::new(&config);
        let bad = json!({"type": "gateway_auth", "gatewaySecret": "wrong"}).to_string();

        for _ in 0..2 {
            let (peer, _outbox) = engine.open_peer();
            let id = engine.attach_client(LOCAL, peer).await;
            assert_eq!(engine.handle_client_frame(&id, &bad).await, Flow::Close);
        }

        // Even the right secret is refused while throttled.
        let (peer, mut outbox) = engine.open_peer();
        let id = engine.attach_client(LOCAL, peer).await;
        let good = json!({"type": "gateway_auth", "gatewaySecret": SECRET}).to_string();
        assert_eq!(engine.handle_client_frame(&id, &good).await, Flow::Close);
        let replies: Vec<ToClient> = drain(&mut outbox);
        assert!(matches!(
            replies.as_slice(),
            [ToClient::GatewayError { code, .. }] if code == "RATE_LIMITED"
        ));
    }

    #[tokio::test]
    async fn wrong_registration_secret_closes_backend() {
        let engine = engine();
        let (peer, mut outbox) = engine.open_peer();
        let mut session = BackendSession::new(LOCAL, peer);
        let register = json!({"type": "register", "gatewaySecret": "nope", "deviceId": "dev-1"});
        assert_eq!(
            engine
                .handle_backend_frame(&mut session, &register.to_string())
                .await,
            Flow::Close
        );
        let replies: Vec<ToBackend> = drain(&mut outbox);
        assert!(matches!(
            replies.as_slice(),
            [ToBackend::RegisterResult { success: false, backend_id: None, .. }]
        ));
        assert!(session.backend_id().is_none());
        assert!(engine.backends().list().await.is_empty());
    }

    #[tokio::test]
    async fn tunnel_round_trip() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;
        authorize(&engine, &client_id, &mut client_out, &mut session, &mut backend_out).await;

        let call = HttpCall {
            method: "GET".into(),
            path: "/status?verbose=1".into(),
            ..Default::default()
        };
        let task = {
            let engine = engine.clone();
            let (client_id, backend_id) = (client_id.clone(), backend_id.clone());
            tokio::spawn(async move {
                engine
                    .proxy_http(&client_id, &backend_id, call, Some(Duration::from_secs(5)))
                    .await
            })
        };

        let frame = backend_out.frames.recv().await.unwrap();
        let ToBackend::HttpProxyRequest(request) = decode::<ToBackend>(&frame).unwrap() else {
            panic!("expected http_proxy_request, got {frame}");
        };
        assert_eq!(request.path, "/status?verbose=1");
        assert!(request.request_id.starts_with("req_"));

        let reply = json!({
            "type": "http_proxy_response",
            "requestId": request.request_id,
            "statusCode": 200,
            "headers": {},
            "body": "ok"
        });
        engine.handle_backend_frame(&mut session, &reply.to_string()).await;

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.headers.is_empty());
        assert_eq!(response.body, "ok");
        assert_eq!(engine.stats().await.pending_http, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_times_out_and_drops_late_response() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;
        authorize(&engine, &client_id, &mut client_out, &mut session, &mut backend_out).await;

        let started = Instant::now();
        let result = engine
            .proxy_http(
                &client_id,
                &backend_id,
                HttpCall::default(),
                Some(Duration::from_secs(5)),
            )
            .await;
        assert!(matches!(result, Err(TetherError::Timeout)));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(engine.stats().await.pending_http, 0);

        let ToBackend::HttpProxyRequest(request) = drain::<ToBackend>(&mut backend_out).remove(0) else {
            panic!("expected http_proxy_request");
        };
        let late = json!({
            "type": "http_proxy_response",
            "requestId": request.request_id,
            "statusCode": 200,
            "body": "late"
        });
        assert_eq!(
            engine.handle_backend_frame(&mut session, &late.to_string()).await,
            Flow::Continue
        );
    }

    #[tokio::test]
    async fn tunnel_fails_fast_when_backend_drops() {
        let engine = engine();
        let (mut session, mut backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;
        authorize(&engine, &client_id, &mut client_out, &mut session, &mut backend_out).await;

        let task = {
            let engine = engine.clone();
            let (client_id, backend_id) = (client_id.clone(), backend_id.clone());
            tokio::spawn(async move {
                engine
                    .proxy_http(&client_id, &backend_id, HttpCall::default(), Some(Duration::from_secs(60)))
                    .await
            })
        };
        backend_out.frames.recv().await.unwrap();
        engine.detach_backend(&session).await;

        assert!(matches!(task.await.unwrap(), Err(TetherError::Transport(_))));
    }

    #[tokio::test]
    async fn tunnel_requires_authorized_client() {
        let engine = engine();
        let (session, _backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, _client_out) = client(&engine).await;

        let denied = engine
            .proxy_http(&client_id, &backend_id, HttpCall::default(), None)
            .await;
        assert!(matches!(denied, Err(TetherError::AuthFailed(_))));

        let missing = engine
            .proxy_http(&client_id, "backend_nope", HttpCall::default(), None)
            .await;
        assert!(matches!(missing, Err(TetherError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_auth_expires_on_sweep() {
        let engine = engine();
        let (session, _backend_out) = backend(&engine, "dev-1").await;
        let backend_id = session.backend_id().unwrap().to_string();
        let (client_id, mut client_out) = client(&engine).await;
        connect(&engine, &client_id, &backend_id).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        engine.sweep().await;

        let replies: Vec<ToClient> = drain(&mut client_out);
        assert_eq!(
            replies,
            vec![ToClient::auth_failed(&backend_id, "backend did not respond")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offline_backend_is_swept_after_grace() {
        let engine = engine();
        let (session, _out) = backend(&engine, "dev-1").await;
        engine.detach_backend(&session).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        engine.sweep().await;
        assert_eq!(engine.backends().list().await.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        engine.sweep().await;
        assert!(engine.backends().list().await.is_empty());
    }
}
