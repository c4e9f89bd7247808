//! Client side of the gateway: authenticate, pick a backend, exchange
//! messages.
//!
//! `GatewayClient` runs a reader task that routes replies to waiting callers
//! and everything else to an event queue, plus a writer task that owns the
//! socket's send half.
//!
//! The event queue is bounded. A caller that stops taking events stalls the
//! reader, and the gateway drops the connection once its own queue for this
//! client fills up.

use crate::proxy::ProxyConfig;
use crate::transport::{self, next_text, send_json, GatewayStream};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tether_core::messages::{FromClient, ToClient};
use tether_core::{decode, encode, BackendSummary, TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

/// Something the gateway pushed without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message {
        backend_id: String,
        message: Value,
    },
    BackendDisconnected {
        backend_id: String,
    },
    Error {
        code: String,
        message: String,
        backend_id: Option<String>,
    },
    /// The gateway connection is gone. Always the last event.
    Closed,
}

type AuthVerdict = TetherResult<()>;

/// Callers waiting on a reply, in request order.
#[derive(Default)]
struct Waiters {
    lists: VecDeque<oneshot::Sender<Vec<BackendSummary>>>,
    auth: HashMap<String, VecDeque<oneshot::Sender<AuthVerdict>>>,
}

impl Waiters {
    fn take_auth(&mut self, backend_id: &str) -> Option<oneshot::Sender<AuthVerdict>> {
        let queue = self.auth.get_mut(backend_id)?;
        let tx = queue.pop_front();
        if queue.is_empty() {
            self.auth.remove(backend_id);
        }
        tx
    }

    /// Fail every `connect_backend` still waiting on a backend that left.
    fn fail_auth(&mut self, backend_id: &str) -> usize {
        let mut failed = 0;
        while let Some(tx) = self.take_auth(backend_id) {
            let _ = tx.send(Err(TetherError::Transport(format!(
                "backend {backend_id} disconnected"
            ))));
            failed += 1;
        }
        failed
    }
}

/// An authenticated connection to the gateway's client port.
pub struct GatewayClient {
    client_id: String,
    outgoing: mpsc::Sender<String>,
    waiters: Arc<Mutex<Waiters>>,
    events: mpsc::Receiver<ClientEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayClient {
    /// Connect and authenticate with the admission secret.
    pub async fn connect(url: &str, gateway_secret: &str) -> TetherResult<Self> {
        Self::connect_with(url, gateway_secret, None).await
    }

    pub async fn connect_with(
        url: &str,
        gateway_secret: &str,
        proxy: Option<&ProxyConfig>,
    ) -> TetherResult<Self> {
        let ws = transport::dial(url, proxy).await?;
        let (mut sink, mut stream) = ws.split();

        send_json(
            &mut sink,
            &FromClient::GatewayAuth {
                gateway_secret: gateway_secret.to_string(),
            },
        )
        .await?;
        let client_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream))
            .await
            .map_err(|_| TetherError::Timeout)??;
        info!(client_id = %client_id, "authenticated with gateway");

        let (outgoing, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "gateway send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let reader = tokio::spawn(read_loop(stream, waiters.clone(), event_tx));

        Ok(Self {
            client_id,
            outgoing,
            waiters,
            events,
            reader,
            writer,
        })
    }

    /// Gateway-assigned id, also used as the HTTP tunnel's client header.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn list_backends(&self) -> TetherResult<Vec<BackendSummary>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.lists.push_back(tx);
        self.send(&FromClient::ListBackends {}).await?;
        wait(rx).await
    }

    /// Present `api_key` to a backend and wait for its verdict.
    ///
    /// Fails with [`TetherError::AuthFailed`] when the backend refuses the key
    /// and with [`TetherError::Transport`] when it disconnects first.
    pub async fn connect_backend(&self, backend_id: &str, api_key: &str) -> TetherResult<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .auth
            .entry(backend_id.to_string())
            .or_default()
            .push_back(tx);
        self.send(&FromClient::ConnectBackend {
            backend_id: backend_id.to_string(),
            api_key: api_key.to_string(),
        })
        .await?;
        wait(rx).await?
    }

    /// Send an application message to an authorized backend. Routing
    /// failures arrive later as [`ClientEvent::Error`].
    pub async fn send_to_backend(&self, backend_id: &str, message: Value) -> TetherResult<()> {
        self.send(&FromClient::SendToBackend {
            backend_id: backend_id.to_string(),
            message,
        })
        .await
    }

    /// Next pushed event; `None` once [`ClientEvent::Closed`] has been taken.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Close the connection after flushing queued frames.
    pub async fn close(self) {
        let Self {
            outgoing,
            reader,
            writer,
            ..
        } = self;
        drop(outgoing);
        let _ = writer.await;
        reader.abort();
    }

    async fn send(&self, msg: &FromClient) -> TetherResult<()> {
        let frame = encode(msg)?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TetherError::Transport("gateway connection closed".into()))
    }
}

async fn wait<T>(rx: oneshot::Receiver<T>) -> TetherResult<T> {
    tokio::time::timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| TetherError::Timeout)?
        .map_err(|_| TetherError::Transport("gateway connection closed".into()))
}

/// Wait for `gateway_auth_result` and return the assigned client id.
async fn handshake<S>(stream: &mut S) -> TetherResult<String>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let Some(text) = next_text(stream).await? else {
            return Err(TetherError::Transport(
                "gateway closed the connection during authentication".into(),
            ));
        };
        match decode::<ToClient>(&text) {
            Ok(ToClient::GatewayAuthResult {
                success: true,
                client_id: Some(client_id),
                ..
            }) => return Ok(client_id),
            Ok(ToClient::GatewayAuthResult { success: true, .. }) => {
                return Err(TetherError::Protocol("gateway_auth_result without clientId".into()));
            }
            Ok(ToClient::GatewayAuthResult { error, .. }) => {
                return Err(TetherError::AuthFailed(
                    error.unwrap_or_else(|| "authentication failed".into()),
                ));
            }
            Ok(ToClient::GatewayError { code, message, .. }) => {
                return Err(TetherError::AuthFailed(format!("{code}: {message}")));
            }
            Ok(_) => debug!("frame before gateway_auth_result ignored"),
            Err(e) => warn!(error = %e, "undecodable frame during authentication"),
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<GatewayStream>,
    waiters: Arc<Mutex<Waiters>>,
    events: mpsc::Sender<ClientEvent>,
) {
    loop {
        let text = match next_text(&mut stream).await {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "gateway connection failed");
                break;
            }
        };
        let msg = match decode::<ToClient>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable gateway frame dropped");
                continue;
            }
        };

        match msg {
            ToClient::BackendsList { backends } => {
                let waiter = waiters.lock().await.lists.pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(backends);
                    }
                    None => debug!("unsolicited backends_list dropped"),
                }
            }
            ToClient::BackendAuthResult {
                backend_id,
                success,
                error,
            } => {
                let waiter = waiters.lock().await.take_auth(&backend_id);
                let verdict = if success {
                    Ok(())
                } else {
                    Err(TetherError::AuthFailed(
                        error.unwrap_or_else(|| "authentication failed".into()),
                    ))
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(verdict);
                    }
                    None => debug!(backend_id = %backend_id, "unsolicited backend_auth_result dropped"),
                }
            }
            ToClient::BackendMessage {
                backend_id,
                message,
            } => {
                let _ = events
                    .send(ClientEvent::Message {
                        backend_id,
                        message,
                    })
                    .await;
            }
            ToClient::BackendDisconnected { backend_id } => {
                let failed = waiters.lock().await.fail_auth(&backend_id);
                info!(backend_id = %backend_id, pending_auth = failed, "backend disconnected");
                let _ = events
                    .send(ClientEvent::BackendDisconnected { backend_id })
                    .await;
            }
            ToClient::GatewayError {
                code,
                message,
                backend_id,
            } => {
                warn!(code = %code, message = %message, "gateway error");
                let _ = events
                    .send(ClientEvent::Error {
                        code,
                        message,
                        backend_id,
                    })
                    .await;
            }
            ToClient::GatewayAuthResult { .. } => debug!("duplicate gateway_auth_result ignored"),
        }
    }

    // Dropping the senders wakes every waiter with a closed-connection error.
    *waiters.lock().await = Waiters::default();
    let _ = events.send(ClientEvent::Closed).await;
}
