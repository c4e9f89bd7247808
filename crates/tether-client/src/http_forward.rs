//! Forward tunneled HTTP calls to a service on the backend's own network.

use std::collections::BTreeMap;
use std::time::Duration;
use tether_core::headers::{append_header, header_values};
use tether_core::{HttpProxyRequest, HttpProxyResponse, TetherError, TetherResult};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe one hop and are not copied in either direction.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Replays `http_proxy_request`s against a local base URL.
#[derive(Debug, Clone)]
pub struct LocalHttpForwarder {
    base_url: String,
    http_client: reqwest::Client,
}

impl LocalHttpForwarder {
    pub fn new(base_url: impl Into<String>) -> TetherResult<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> TetherResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TetherError::Config(format!("upstream must be an http(s) URL: {base_url}")));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TetherError::Config(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform the call. Upstream failures become a 502 response rather than
    /// an error so the tunneled caller always gets an answer.
    pub async fn forward(&self, request: &HttpProxyRequest) -> HttpProxyResponse {
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "upstream call failed");
                HttpProxyResponse {
                    request_id: request.request_id.clone(),
                    status_code: 502,
                    headers: BTreeMap::new(),
                    body: format!("upstream error: {e}"),
                }
            }
        }
    }

    async fn try_forward(&self, request: &HttpProxyRequest) -> TetherResult<HttpProxyResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TetherError::Protocol(format!("invalid method: {}", request.method)))?;
        let path = if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };
        let url = format!("{}{}", self.base_url, path);
        debug!(request_id = %request.request_id, method = %method, url = %url, "forwarding upstream");

        let mut builder = self.http_client.request(method, &url);
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            for value in header_values(name, value) {
                builder = builder.header(name.as_str(), value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TetherError::Transport(e.to_string()))?;

        let status_code = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                append_header(&mut headers, name.as_str(), value);
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| TetherError::Transport(e.to_string()))?;

        Ok(HttpProxyResponse {
            request_id: request.request_id.clone(),
            status_code,
            headers,
            body,
        })
    }
}
