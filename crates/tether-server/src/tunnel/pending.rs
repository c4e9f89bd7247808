//! Correlation table for tunneled HTTP calls.
//!
//! Each in-flight call parks a oneshot sender under its request id. The
//! backend's connection task completes it when the matching response arrives;
//! the caller's deadline removes it otherwise. Every entry has a deadline, and
//! [`PendingRequests::sweep_expired`] removes any entry whose caller went away
//! without cleaning up.

use std::collections::HashMap;
use tether_core::{HttpProxyResponse, TetherError, TetherResult};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

pub type Completion = TetherResult<HttpProxyResponse>;

struct PendingEntry {
    origin_client_id: String,
    target_backend_id: String,
    /// Backend transport the request went out on.
    target_conn_id: u64,
    deadline: Instant,
    tx: oneshot::Sender<Completion>,
}

/// Pending HTTP requests keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a new request. Duplicate ids among pending entries are refused.
    pub async fn insert(
        &self,
        request_id: &str,
        origin_client_id: &str,
        target_backend_id: &str,
        target_conn_id: u64,
        deadline: Instant,
    ) -> TetherResult<oneshot::Receiver<Completion>> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(request_id) {
            return Err(TetherError::Other(format!("duplicate request id {request_id}")));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            request_id.to_string(),
            PendingEntry {
                origin_client_id: origin_client_id.to_string(),
                target_backend_id: target_backend_id.to_string(),
                target_conn_id,
                deadline,
                tx,
            },
        );
        Ok(rx)
    }

    /// Resolve a request with the backend's response.
    ///
    /// Returns `false` for unknown ids and for responses from a backend other
    /// than the one the request was sent to. Such responses are dropped.
    pub async fn complete(&self, from_backend: &str, response: HttpProxyResponse) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(&response.request_id) {
            Some(entry) if entry.target_backend_id == from_backend => {}
            Some(_) => {
                warn!(
                    request_id = %response.request_id,
                    backend_id = %from_backend,
                    "response from wrong backend dropped"
                );
                return false;
            }
            None => return false,
        }
        let Some(entry) = entries.remove(&response.request_id) else {
            return false;
        };
        drop(entries);

        debug!(
            request_id = %response.request_id,
            client_id = %entry.origin_client_id,
            status = response.status_code,
            "tunnel response matched"
        );
        // The caller may have given up in the meantime.
        let _ = entry.tx.send(Ok(response));
        true
    }

    /// Drop an entry, e.g. after its caller timed out.
    pub async fn remove(&self, request_id: &str) -> bool {
        self.entries.lock().await.remove(request_id).is_some()
    }

    /// Fail every request sent over a backend transport that just went away.
    pub async fn fail_backend(&self, backend_id: &str, conn_id: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.target_backend_id == backend_id && e.target_conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = entries.remove(id) {
                let _ = entry
                    .tx
                    .send(Err(TetherError::Transport(format!("backend {backend_id} disconnected"))));
            }
        }
        ids.len()
    }

    /// Remove entries past their deadline, completing them with a timeout.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = entries.remove(id) {
                let _ = entry.tx.send(Err(TetherError::Timeout));
            }
        }
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn response(request_id: &str) -> HttpProxyResponse {
        HttpProxyResponse {
            request_id: request_id.into(),
            status_code: 200,
            headers: BTreeMap::new(),
            body: "ok".into(),
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn complete_resolves_waiter() {
        let table = PendingRequests::new();
        let rx = table.insert("req_1", "client_a", "backend_b", 1, soon()).await.unwrap();
        assert!(table.complete("backend_b", response("req_1")).await);
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.body, "ok");
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let table = PendingRequests::new();
        assert!(!table.complete("backend_b", response("req_missing")).await);
    }

    #[tokio::test]
    async fn duplicate_id_refused() {
        let table = PendingRequests::new();
        let _rx = table.insert("req_1", "c", "b", 1, soon()).await.unwrap();
        assert!(table.insert("req_1", "c", "b", 1, soon()).await.is_err());
    }

    #[tokio::test]
    async fn response_from_other_backend_ignored() {
        let table = PendingRequests::new();
        let _rx = table.insert("req_1", "c", "backend_b", 1, soon()).await.unwrap();
        assert!(!table.complete("backend_evil", response("req_1")).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn late_response_after_removal_is_unknown() {
        let table = PendingRequests::new();
        let _rx = table.insert("req_1", "c", "b", 1, soon()).await.unwrap();
        assert!(table.remove("req_1").await);
        assert!(!table.complete("b", response("req_1")).await);
    }

    #[tokio::test]
    async fn fail_backend_errors_its_requests_only() {
        let table = PendingRequests::new();
        let rx1 = table.insert("req_1", "c", "backend_b", 1, soon()).await.unwrap();
        let _rx2 = table.insert("req_2", "c", "backend_other", 1, soon()).await.unwrap();
        assert_eq!(table.fail_backend("backend_b", 1).await, 1);
        assert!(matches!(rx1.await.unwrap(), Err(TetherError::Transport(_))));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn fail_backend_spares_newer_transport() {
        let table = PendingRequests::new();
        let _old = table.insert("req_1", "c", "backend_b", 1, soon()).await.unwrap();
        let _new = table.insert("req_2", "c", "backend_b", 2, soon()).await.unwrap();
        assert_eq!(table.fail_backend("backend_b", 1).await, 1);
        assert!(table.complete("backend_b", response("req_2")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_past_deadline() {
        let table = PendingRequests::new();
        let rx = table.insert("req_1", "c", "b", 1, soon()).await.unwrap();
        assert!(table.sweep_expired().await.is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.sweep_expired().await, vec!["req_1".to_string()]);
        assert!(matches!(rx.await.unwrap(), Err(TetherError::Timeout)));
    }
}
