//! Outbound handle for one connected peer (backend or client).
//!
//! Registries hold a [`PeerHandle`]; the connection task owns the matching
//! [`PeerOutbox`] and drains it onto the socket. The queue is bounded: a peer
//! too slow to keep up is closed instead of buffering without limit.

use std::sync::Arc;
use tether_core::{encode, TetherError, TetherResult};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Cheap, cloneable sender side of a peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    conn_id: u64,
    tx: mpsc::Sender<String>,
    close_tx: Arc<watch::Sender<bool>>,
}

/// Receiver side, owned by the connection task.
pub struct PeerOutbox {
    pub frames: mpsc::Receiver<String>,
    pub close_rx: watch::Receiver<bool>,
}

impl PeerHandle {
    /// Create a handle/outbox pair with a bounded queue of `capacity` frames.
    pub fn channel(conn_id: u64, capacity: usize) -> (Self, PeerOutbox) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        (
            Self {
                conn_id,
                tx,
                close_tx: Arc::new(close_tx),
            },
            PeerOutbox { frames, close_rx },
        )
    }

    /// Transport generation this handle belongs to.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue an envelope without waiting.
    ///
    /// A full queue closes the connection and reports a transport error.
    pub fn send<T: serde::Serialize>(&self, envelope: &T) -> TetherResult<()> {
        let frame = encode(envelope)?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.conn_id, "outbound queue full, closing connection");
                self.close();
                Err(TetherError::Transport("outbound queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(TetherError::Transport("connection closed".into()))
            }
        }
    }

    /// Ask the connection task to shut the transport down.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.tx.is_closed()
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::messages::ToClient;

    fn ping() -> ToClient {
        ToClient::BackendDisconnected {
            backend_id: "backend_1".into(),
        }
    }

    #[test]
    fn send_queues_encoded_frame() {
        let (peer, mut outbox) = PeerHandle::channel(1, 4);
        peer.send(&ping()).unwrap();
        let frame = outbox.frames.try_recv().unwrap();
        assert!(frame.contains("backend_disconnected"));
    }

    #[test]
    fn full_queue_closes_connection() {
        let (peer, outbox) = PeerHandle::channel(7, 2);
        peer.send(&ping()).unwrap();
        peer.send(&ping()).unwrap();
        let err = peer.send(&ping()).unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
        assert!(*outbox.close_rx.borrow());
        assert!(peer.is_closed());
    }

    #[test]
    fn dropped_outbox_reports_closed() {
        let (peer, outbox) = PeerHandle::channel(3, 2);
        drop(outbox);
        assert!(peer.send(&ping()).is_err());
        assert!(peer.is_closed());
    }
}
