//! HTTP ingress for the tunnel.
//!
//! `ANY /backends/{backend_id}/http/{*path}` is turned into an
//! `http_proxy_request` for that backend, on behalf of the client named in the
//! `x-tether-client-id` header. The client must already be authorized for the
//! backend over its WebSocket.

use crate::relay::{HttpCall, RelayEngine};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::headers::{append_header, header_values};
use tether_core::{ErrorCode, HttpProxyResponse, TetherError, MAX_FRAME_SIZE};
use tracing::debug;

/// Header naming the gateway-assigned client id of the caller.
pub const CLIENT_ID_HEADER: &str = "x-tether-client-id";

/// Headers that describe one hop and never cross the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    CLIENT_ID_HEADER,
];

/// Build the ingress router.
pub fn router(engine: Arc<RelayEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backends/{backend_id}/http", any(tunnel_root))
        .route("/backends/{backend_id}/http/{*path}", any(tunnel))
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .with_state(engine)
}

async fn health(State(engine): State<Arc<RelayEngine>>) -> impl IntoResponse {
    let stats = engine.stats().await;
    Json(json!({
        "status": "ok",
        "backends_online": stats.backends_online,
        "clients": stats.clients,
        "pending_http": stats.pending_http,
    }))
}

async fn tunnel_root(
    State(engine): State<Arc<RelayEngine>>,
    Path(backend_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TunnelError> {
    forward(&engine, &backend_id, method, &uri, &headers, body).await
}

async fn tunnel(
    State(engine): State<Arc<RelayEngine>>,
    Path((backend_id, _)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TunnelError> {
    forward(&engine, &backend_id, method, &uri, &headers, body).await
}

/// Path and query as the backend should see them: whatever follows
/// `/backends/{id}/http` in the raw request URI, still percent-encoded.
fn backend_target(uri: &Uri) -> String {
    let suffix = uri
        .path()
        .strip_prefix("/backends/")
        .and_then(|rest| rest.split_once('/'))
        .and_then(|(_, rest)| rest.strip_prefix("http"))
        .unwrap_or("");
    let mut target = format!("/{}", suffix.trim_start_matches('/'));
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

async fn forward(
    engine: &RelayEngine,
    backend_id: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, TunnelError> {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            TunnelError::new(
                StatusCode::UNAUTHORIZED,
                ErrorCode::NotAuthenticated.as_str(),
                format!("missing {CLIENT_ID_HEADER} header"),
            )
        })?
        .to_string();

    let body = String::from_utf8(body.to_vec()).map_err(|_| {
        TunnelError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::ProtocolError.as_str(),
            "request body must be UTF-8 text",
        )
    })?;

    let target = backend_target(uri);
    debug!(backend_id = %backend_id, method = %method, path = %target, "tunnel ingress");

    let call = HttpCall {
        method: method.as_str().to_string(),
        path: target,
        headers: collect_headers(headers),
        body,
    };
    let response = engine.proxy_http(&client_id, backend_id, call, None).await?;
    Ok(into_http(response))
}

/// Flatten request headers, dropping hop-by-hop ones.
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if HOP_BY_HOP.contains(&name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            append_header(&mut out, name, value);
        }
    }
    out
}

fn into_http(response: HttpProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        let Ok(header) = HeaderName::from_bytes(lower.as_bytes()) else {
            debug!(header = %name, "invalid response header dropped");
            continue;
        };
        for value in header_values(&lower, value) {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(header.clone(), value);
                }
                Err(_) => debug!(header = %name, "invalid response header value dropped"),
            }
        }
    }
    (status, headers, response.body).into_response()
}

/// Tunnel failure rendered as `{"error", "code"}`.
#[derive(Debug)]
pub struct TunnelError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl TunnelError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<TetherError> for TunnelError {
    fn from(err: TetherError) -> Self {
        let (status, code) = match &err {
            TetherError::AuthFailed(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::BackendNotAuthenticated.as_str(),
            ),
            TetherError::NotFound(_) => {
                (StatusCode::NOT_FOUND, ErrorCode::BackendNotFound.as_str())
            }
            TetherError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            TetherError::Transport(_) => {
                (StatusCode::BAD_GATEWAY, ErrorCode::BackendOffline.as_str())
            }
            _ => (StatusCode::BAD_GATEWAY, "BAD_GATEWAY"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}
