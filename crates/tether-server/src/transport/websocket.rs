//! WebSocket listener using tokio-tungstenite.
//!
//! The gateway runs two of these: one for backends, one for clients. Each
//! accepted socket carries JSON text frames, one envelope per frame.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tether_core::{TetherError, TetherResult, MAX_FRAME_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// One inbound frame, as seen by a connection loop.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    /// A frame that cannot be an envelope. Dropped, the connection stays up.
    Malformed(String),
    Closed,
}

/// Socket limits for accepted connections. Frames and messages above
/// [`MAX_FRAME_SIZE`] fail while their header is read, before any payload is
/// buffered.
pub fn accept_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config.max_frame_size = Some(MAX_FRAME_SIZE);
    config
}

/// Bind and start a WebSocket listener.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    label: &'static str,
) -> TetherResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TetherError::Transport(format!("{label} bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, listener = label, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async_with_config(stream, Some(accept_config())).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, listener = label, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!(listener = label, "WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, listener = label, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> TetherResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| TetherError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next envelope-bearing frame.
///
/// Binary frames are accepted when they hold UTF-8. Pings are answered here.
/// An oversized frame is a protocol error that ends the connection, since the
/// rest of it is never read.
pub async fn ws_recv_text(ws: &mut WsStream) -> TetherResult<Inbound> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text)),
            Some(Ok(Message::Binary(data))) => {
                return Ok(match String::from_utf8(data) {
                    Ok(text) => Inbound::Text(text),
                    Err(_) => Inbound::Malformed("binary frame is not UTF-8".into()),
                });
            }
            Some(Ok(Message::Close(_))) => return Ok(Inbound::Closed),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::Capacity(e))) => {
                return Err(TetherError::Protocol(format!("frame too large: {e}")));
            }
            Some(Err(e)) => {
                return Err(TetherError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(Inbound::Closed),
        }
    }
}

/// Close the socket politely, ignoring errors.
pub async fn ws_close(ws: &mut WsStream) {
    let _ = ws.close(None).await;
}
