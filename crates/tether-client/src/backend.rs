//! Backend lifecycle: dial the gateway, register, serve relayed traffic and
//! reconnect when the link drops.
//!
//! A [`BackendAgent`] owns one outbound connection at a time. Its state is
//! published on a watch channel so callers can wait for the gateway to
//! confirm the backend id after every (re)connect.

use crate::handler::{BackendHandler, Responder};
use crate::proxy::ProxyConfig;
use crate::transport::{self, next_text, send_json};
use futures_util::{SinkExt, Stream, StreamExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_core::messages::{FromBackend, ToBackend};
use tether_core::{decode, encode, new_device_id, TetherError, TetherResult};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const BACKEND_ID_POLL: Duration = Duration::from_millis(100);

/// Settings for one backend agent.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend WebSocket endpoint, e.g. `ws://gateway:7400`.
    pub gateway_url: String,
    pub gateway_secret: String,
    /// Stable device identity. Loaded from `~/.tether/device_id` when unset.
    pub device_id: Option<String>,
    /// Display name shown to clients.
    pub name: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How long to wait for `register_result` after connecting.
    pub register_timeout: Duration,
}

impl BackendConfig {
    pub fn new(gateway_url: impl Into<String>, gateway_secret: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            gateway_secret: gateway_secret.into(),
            device_id: None,
            name: None,
            proxy: None,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the agent's gateway link currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Registering,
    Online { backend_id: String },
}

/// Keeps a backend registered with the gateway.
pub struct BackendAgent {
    config: BackendConfig,
    handler: Arc<dyn BackendHandler>,
}

impl BackendAgent {
    pub fn new(config: BackendConfig, handler: Arc<dyn BackendHandler>) -> Self {
        Self { config, handler }
    }

    /// Start the agent on its own task. Dropping the returned handle stops it.
    pub fn spawn(self) -> BackendHandle {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(state_tx, stop_rx));
        BackendHandle {
            state: state_rx,
            stop: stop_tx,
            task,
        }
    }

    async fn run(
        self,
        state: watch::Sender<LinkState>,
        mut stop: watch::Receiver<bool>,
    ) -> TetherResult<()> {
        let device_id = match &self.config.device_id {
            Some(id) => id.clone(),
            None => load_or_create_device_id(&default_device_id_path()?)?,
        };
        let mut delay = self.config.reconnect_delay;

        loop {
            if *stop.borrow() {
                break;
            }
            state.send_replace(LinkState::Connecting);

            let mut registered = false;
            let outcome = tokio::select! {
                outcome = self.session(&device_id, &state, &mut registered) => outcome,
                _ = stop.changed() => {
                    state.send_replace(LinkState::Disconnected);
                    break;
                }
            };
            state.send_replace(LinkState::Disconnected);

            if registered {
                delay = self.config.reconnect_delay;
            }
            match outcome {
                Err(TetherError::AuthFailed(reason)) => {
                    error!(reason = %reason, "gateway rejected registration");
                    return Err(TetherError::AuthFailed(reason));
                }
                Err(e) => warn!(error = %e, retry_in = ?delay, "gateway link failed"),
                Ok(()) => info!(retry_in = ?delay, "gateway closed the link"),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
            delay = next_delay(delay, self.config.reconnect_max_delay);
        }

        debug!("backend agent stopped");
        Ok(())
    }

    /// One connection: register, then serve until the gateway goes away.
    async fn session(
        &self,
        device_id: &str,
        state: &watch::Sender<LinkState>,
        registered: &mut bool,
    ) -> TetherResult<()> {
        let ws = transport::dial(&self.config.gateway_url, self.config.proxy.as_ref()).await?;
        let (mut sink, mut stream) = ws.split();

        state.send_replace(LinkState::Registering);
        send_json(
            &mut sink,
            &FromBackend::Register {
                gateway_secret: self.config.gateway_secret.clone(),
                device_id: device_id.to_string(),
                name: self.config.name.clone(),
            },
        )
        .await?;

        let backend_id = tokio::time::timeout(
            self.config.register_timeout,
            await_registration(&mut stream),
        )
        .await
        .map_err(|_| TetherError::Timeout)??;
        *registered = true;
        info!(backend_id = %backend_id, "registered with gateway");
        state.send_replace(LinkState::Online { backend_id });

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "gateway send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = loop {
            match next_text(&mut stream).await {
                Ok(Some(text)) => self.dispatch(&text, &out_tx).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        writer.abort();
        result
    }

    /// Handle one gateway frame. Auth and forwarded messages run inline to
    /// keep per-client ordering; HTTP calls run on their own tasks.
    async fn dispatch(&self, text: &str, out: &mpsc::Sender<String>) {
        let msg = match decode::<ToBackend>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable gateway frame dropped");
                return;
            }
        };

        match msg {
            ToBackend::ClientAuth { client_id, api_key } => {
                let verdict = self.handler.authenticate_client(&client_id, &api_key).await;
                debug!(client_id = %client_id, ok = verdict.is_ok(), "client auth decided");
                let (success, error) = match verdict {
                    Ok(()) => (true, None),
                    Err(reason) => (false, Some(reason)),
                };
                queue(
                    out,
                    &FromBackend::ClientAuthResult {
                        client_id,
                        success,
                        error,
                    },
                )
                .await;
            }
            ToBackend::Forwarded { client_id, message } => {
                let responder = Responder::new(client_id.clone(), out.clone());
                self.handler.on_forwarded(&client_id, message, responder).await;
            }
            ToBackend::ClientConnected { client_id } => {
                self.handler.on_client_connected(&client_id).await;
            }
            ToBackend::ClientDisconnected { client_id } => {
                self.handler.on_client_disconnected(&client_id).await;
            }
            ToBackend::HttpProxyRequest(request) => {
                let handler = self.handler.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id.clone();
                    let mut response = handler.on_http_request(request).await;
                    response.request_id = request_id;
                    queue(&out, &FromBackend::HttpProxyResponse(response)).await;
                });
            }
            ToBackend::RegisterResult { .. } => {
                debug!("duplicate register_result ignored");
            }
        }
    }
}

/// Wait for the gateway's answer to `register`.
async fn await_registration<S>(stream: &mut S) -> TetherResult<String>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let Some(text) = next_text(stream).await? else {
            return Err(TetherError::Transport(
                "gateway closed the link during registration".into(),
            ));
        };
        match decode::<ToBackend>(&text) {
            Ok(ToBackend::RegisterResult {
                success: true,
                backend_id: Some(backend_id),
                ..
            }) => return Ok(backend_id),
            Ok(ToBackend::RegisterResult { success: true, .. }) => {
                return Err(TetherError::Protocol("register_result without backendId".into()));
            }
            Ok(ToBackend::RegisterResult { error, .. }) => {
                let reason = error.unwrap_or_else(|| "registration rejected".into());
                // Throttling is transient; anything else means a bad secret.
                if reason == "RATE_LIMITED" {
                    return Err(TetherError::Transport(reason));
                }
                return Err(TetherError::AuthFailed(reason));
            }
            Ok(_) => debug!("frame before register_result ignored"),
            Err(e) => warn!(error = %e, "undecodable frame during registration"),
        }
    }
}

async fn queue(out: &mpsc::Sender<String>, msg: &FromBackend) {
    match encode(msg) {
        Ok(frame) => {
            if out.send(frame).await.is_err() {
                debug!("gateway link closed, reply dropped");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Control handle for a running [`BackendAgent`].
pub struct BackendHandle {
    state: watch::Receiver<LinkState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<TetherResult<()>>,
}

impl BackendHandle {
    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// The gateway-confirmed backend id, if currently online.
    pub fn backend_id(&self) -> Option<String> {
        match &*self.state.borrow() {
            LinkState::Online { backend_id } => Some(backend_id.clone()),
            _ => None,
        }
    }

    /// Poll until the gateway confirms a backend id, giving up after
    /// `timeout` or when the agent has stopped.
    pub async fn wait_for_backend_id(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = self.backend_id() {
                return Some(id);
            }
            if self.task.is_finished() || Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(BACKEND_ID_POLL).await;
        }
    }

    /// Stop the agent and wait for it to wind down.
    pub async fn shutdown(self) -> TetherResult<()> {
        let _ = self.stop.send(true);
        self.join().await
    }

    /// Wait for the agent to end on its own, e.g. after a rejected
    /// registration.
    pub async fn join(self) -> TetherResult<()> {
        let Self { stop, task, .. } = self;
        let outcome = task.await;
        drop(stop);
        outcome.map_err(|e| TetherError::Other(format!("backend agent task failed: {e}")))?
    }
}

/// `~/.tether/device_id`.
pub fn default_device_id_path() -> TetherResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TetherError::Config("cannot determine home directory".into()))?;
    Ok(home.join(".tether").join("device_id"))
}

/// Read the device id stored at `path`, creating one on first use.
pub fn load_or_create_device_id(path: &Path) -> TetherResult<String> {
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let id = new_device_id();
    fs::write(path, format!("{id}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "created device id");
    Ok(id)
}
