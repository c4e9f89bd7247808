//! The application side of a backend: what it does with relayed traffic.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tether_core::messages::FromBackend;
use tether_core::{encode, HttpProxyRequest, HttpProxyResponse, TetherError, TetherResult};
use tokio::sync::mpsc;

/// Boxed future returned by [`BackendHandler`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callbacks a [`BackendAgent`](crate::BackendAgent) invokes for gateway traffic.
///
/// Forwarded messages and auth requests are delivered in order, one at a
/// time. Tunneled HTTP requests run concurrently.
pub trait BackendHandler: Send + Sync + 'static {
    /// Check a client's API key. `Err` carries the reason shown to the client.
    fn authenticate_client<'a>(
        &'a self,
        client_id: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<(), String>>;

    fn on_client_connected<'a>(&'a self, _client_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_client_disconnected<'a>(&'a self, _client_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// An application message from an authorized client. Replies go through
    /// `responder`, now or later.
    fn on_forwarded<'a>(
        &'a self,
        client_id: &'a str,
        message: Value,
        responder: Responder,
    ) -> BoxFuture<'a, ()>;

    /// A tunneled HTTP call. The default answers 404.
    fn on_http_request(&self, request: HttpProxyRequest) -> BoxFuture<'_, HttpProxyResponse> {
        Box::pin(async move {
            HttpProxyResponse {
                request_id: request.request_id,
                status_code: 404,
                headers: Default::default(),
                body: "no HTTP handler".into(),
            }
        })
    }
}

/// Sends `backend_response` messages to one client.
#[derive(Clone)]
pub struct Responder {
    client_id: String,
    out: mpsc::Sender<String>,
}

impl Responder {
    pub(crate) fn new(client_id: String, out: mpsc::Sender<String>) -> Self {
        Self { client_id, out }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send `message` to the client. Fails once the gateway link is gone.
    pub async fn send(&self, message: Value) -> TetherResult<()> {
        let frame = encode(&FromBackend::BackendResponse {
            client_id: self.client_id.clone(),
            message,
        })?;
        self.out
            .send(frame)
            .await
            .map_err(|_| TetherError::Transport("gateway link closed".into()))
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::decode;

    #[tokio::test]
    async fn responder_wraps_backend_response() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = Responder::new("client_1".into(), tx);
        responder.send(json!({"ok": true})).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let msg: FromBackend = decode(&frame).unwrap();
        assert_eq!(
            msg,
            FromBackend::BackendResponse {
                client_id: "client_1".into(),
                message: json!({"ok": true}),
            }
        );
    }

    #[tokio::test]
    async fn responder_fails_after_link_drops() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let responder = Responder::new("client_1".into(), tx);
        assert!(matches!(
            responder.send(json!(1)).await,
            Err(TetherError::Transport(_))
        ));
    }
}
