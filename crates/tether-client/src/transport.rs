//! Outbound WebSocket dialing, direct or through a SOCKS5 proxy.

use crate::proxy::ProxyConfig;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tether_core::{encode, TetherError, TetherResult, MAX_FRAME_SIZE};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// A WebSocket connection to the gateway.
pub type GatewayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `url`, tunneling the TCP connection through `proxy`
/// when one is given.
pub async fn dial(url: &str, proxy: Option<&ProxyConfig>) -> TetherResult<GatewayStream> {
    let Some(proxy) = proxy else {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TetherError::Transport(format!("connect to {url} failed: {e}")))?;
        debug!(url = %url, "connected");
        return Ok(ws);
    };

    let (host, port) = target_of(url)?;
    let tcp = proxy.connect(&host, port).await?;
    let (ws, _) = tokio_tungstenite::client_async_tls(url, tcp)
        .await
        .map_err(|e| TetherError::Transport(format!("WebSocket handshake with {url} failed: {e}")))?;
    debug!(url = %url, proxy = %proxy.host, "connected through proxy");
    Ok(ws)
}

/// Host and port a `ws://` or `wss://` URL points at.
fn target_of(url: &str) -> TetherResult<(String, u16)> {
    let uri: Uri = url
        .parse()
        .map_err(|e| TetherError::Config(format!("invalid gateway URL {url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| TetherError::Config(format!("gateway URL has no host: {url}")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("wss")) => 443,
        (None, Some("ws")) => 80,
        _ => return Err(TetherError::Config(format!("unsupported gateway URL: {url}"))),
    };
    Ok((host, port))
}

/// Encode and send one envelope.
pub async fn send_json<S, T>(sink: &mut S, envelope: &T) -> TetherResult<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    T: serde::Serialize,
{
    let frame = encode(envelope)?;
    sink.send(Message::Text(frame))
        .await
        .map_err(|e| TetherError::Transport(format!("WS send failed: {e}")))
}

/// Next text frame, or `None` once the gateway closed the connection.
/// Frames too large to be envelopes are skipped.
pub async fn next_text<S>(stream: &mut S) -> TetherResult<Option<String>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) if text.len() > MAX_FRAME_SIZE => {
                warn!(len = text.len(), "oversized frame dropped");
            }
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) if text.len() <= MAX_FRAME_SIZE => return Ok(Some(text)),
                _ => warn!("binary frame dropped"),
            },
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TetherError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}
