//! Gateway server: binds the listeners and runs one task per transport.
//!
//! Backends and clients connect on separate WebSocket ports; the HTTP tunnel
//! ingress has its own port. Every connection task drains its peer's outbound
//! queue onto the socket and feeds inbound frames to the [`RelayEngine`].

use crate::config::GatewayConfig;
use crate::relay::{BackendSession, Flow, RelayEngine};
use crate::transport::websocket::{self, ws_close, ws_recv_text, ws_send_text, WsStream};
use crate::transport::{Inbound, PeerOutbox, WebSocketConnection};
use crate::tunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::messages::ToClient;
use tether_core::{ErrorCode, TetherError, TetherResult};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often offline backends, stale auth requests and orphaned tunnel calls
/// are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// The tether gateway.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<RelayEngine>,
}

/// A gateway whose listeners are bound and running.
pub struct RunningGateway {
    pub backend_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub http_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl RunningGateway {
    /// Wait until the accept loop ends (both WebSocket listeners closed).
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.accept_task).await {
            if !e.is_cancelled() {
                error!(error = %e, "accept loop failed");
            }
        }
    }

    /// Stop accepting and tear down the background tasks.
    pub fn shutdown(self) {
        self.accept_task.abort();
        self.http_task.abort();
        self.sweep_task.abort();
    }
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        let engine = Arc::new(RelayEngine::new(&config));
        Self { config, engine }
    }

    pub fn engine(&self) -> Arc<RelayEngine> {
        self.engine.clone()
    }

    /// Bind all three listeners and start serving.
    pub async fn bind(self) -> TetherResult<RunningGateway> {
        let (backend_addr, mut backend_rx) =
            websocket::start_listener(self.config.backend_addr, "backend").await?;
        let (client_addr, mut client_rx) =
            websocket::start_listener(self.config.client_addr, "client").await?;

        let http_listener = TcpListener::bind(self.config.http_addr)
            .await
            .map_err(|e| {
                TetherError::Transport(format!("http bind failed on {}: {e}", self.config.http_addr))
            })?;
        let http_addr = http_listener.local_addr()?;
        let app = tunnel::router(self.engine.clone());
        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!(error = %e, "http ingress stopped");
            }
        });
        info!(addr = %http_addr, "HTTP tunnel listener started");

        let sweeper = self.engine.clone();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                sweeper.sweep().await;
            }
        });

        let engine = self.engine.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(conn) = backend_rx.recv() => {
                        tokio::spawn(serve_backend(engine.clone(), conn));
                    }
                    Some(conn) = client_rx.recv() => {
                        tokio::spawn(serve_client(engine.clone(), conn));
                    }
                    else => {
                        info!("all listeners closed, shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            backend = %backend_addr,
            client = %client_addr,
            http = %http_addr,
            "tether gateway ready"
        );

        Ok(RunningGateway {
            backend_addr,
            client_addr,
            http_addr,
            accept_task,
            http_task,
            sweep_task,
        })
    }
}

/// Connection loop for one backend transport.
async fn serve_backend(engine: Arc<RelayEngine>, conn: WebSocketConnection) {
    let WebSocketConnection {
        mut ws_stream,
        remote_addr,
    } = conn;
    let (peer, mut outbox) = engine.open_peer();
    let mut session = BackendSession::new(remote_addr.ip(), peer);
    debug!(remote = %remote_addr, conn_id = session.conn_id(), "backend transport opened");

    loop {
        tokio::select! {
            _ = outbox.close_rx.changed() => {
                flush(&mut ws_stream, &mut outbox).await;
                break;
            }
            Some(frame) = outbox.frames.recv() => {
                if let Err(e) = ws_send_text(&mut ws_stream, frame).await {
                    debug!(conn_id = session.conn_id(), error = %e, "backend send failed");
                    break;
                }
            }
            inbound = ws_recv_text(&mut ws_stream) => {
                match inbound {
                    Ok(Inbound::Text(text)) => {
                        if engine.handle_backend_frame(&mut session, &text).await == Flow::Close {
                            flush(&mut ws_stream, &mut outbox).await;
                            break;
                        }
                    }
                    Ok(Inbound::Malformed(reason)) => {
                        warn!(conn_id = session.conn_id(), reason = %reason, "backend frame dropped");
                    }
                    Ok(Inbound::Closed) => break,
                    Err(e @ TetherError::Protocol(_)) => {
                        warn!(conn_id = session.conn_id(), error = %e, "backend frame refused, closing");
                        break;
                    }
                    Err(e) => {
                        debug!(conn_id = session.conn_id(), error = %e, "backend transport error");
                        break;
                    }
                }
            }
        }
    }

    engine.detach_backend(&session).await;
    ws_close(&mut ws_stream).await;
    debug!(remote = %remote_addr, conn_id = session.conn_id(), "backend transport closed");
}

/// Connection loop for one client transport.
async fn serve_client(engine: Arc<RelayEngine>, conn: WebSocketConnection) {
    let WebSocketConnection {
        mut ws_stream,
        remote_addr,
    } = conn;
    let (peer, mut outbox) = engine.open_peer();
    let client_id = engine.attach_client(remote_addr.ip(), peer.clone()).await;
    debug!(remote = %remote_addr, client_id = %client_id, "client transport opened");

    loop {
        tokio::select! {
            _ = outbox.close_rx.changed() => {
                flush(&mut ws_stream, &mut outbox).await;
                break;
            }
            Some(frame) = outbox.frames.recv() => {
                if let Err(e) = ws_send_text(&mut ws_stream, frame).await {
                    debug!(client_id = %client_id, error = %e, "client send failed");
                    break;
                }
            }
            inbound = ws_recv_text(&mut ws_stream) => {
                match inbound {
                    Ok(Inbound::Text(text)) => {
                        if engine.handle_client_frame(&client_id, &text).await == Flow::Close {
                            flush(&mut ws_stream, &mut outbox).await;
                            break;
                        }
                    }
                    Ok(Inbound::Malformed(reason)) => {
                        warn!(client_id = %client_id, reason = %reason, "client frame dropped");
                        let _ = peer.send(&ToClient::error(ErrorCode::ProtocolError, reason, None));
                    }
                    Ok(Inbound::Closed) => break,
                    Err(e @ TetherError::Protocol(_)) => {
                        warn!(client_id = %client_id, error = %e, "client frame refused, closing");
                        break;
                    }
                    Err(e) => {
                        debug!(client_id = %client_id, error = %e, "client transport error");
                        break;
                    }
                }
            }
        }
    }

    engine.detach_client(&client_id).await;
    ws_close(&mut ws_stream).await;
}

/// Write out whatever is still queued, e.g. a failure reply before closing.
async fn flush(ws: &mut WsStream, outbox: &mut PeerOutbox) {
    while let Ok(frame) = outbox.frames.try_recv() {
        if ws_send_text(ws, frame).await.is_err() {
            break;
        }
    }
}
