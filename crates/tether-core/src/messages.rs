//! Envelope types for the tether wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator in snake_case and
//! camelCase fields. There is one enum per direction so that a peer can never
//! send a message the other side is not supposed to receive.
//!
//! `message` payloads are opaque application data. The gateway carries them as
//! a [`serde_json::Value`] and never looks inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Summary of one registered backend, as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub backend_id: String,
    pub name: String,
    pub online: bool,
}

/// An HTTP-shaped call tunneled from the gateway to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyRequest {
    pub request_id: String,
    pub method: String,
    /// Path plus query string, e.g. `/api/items?page=2`.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// The backend's answer to an [`HttpProxyRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Backend → gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FromBackend {
    Register {
        gateway_secret: String,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ClientAuthResult {
        client_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BackendResponse {
        client_id: String,
        message: Value,
    },
    HttpProxyResponse(HttpProxyResponse),
}

/// Gateway → backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToBackend {
    RegisterResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ClientAuth {
        client_id: String,
        api_key: String,
    },
    Forwarded {
        client_id: String,
        message: Value,
    },
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
    HttpProxyRequest(HttpProxyRequest),
}

/// Client → gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FromClient {
    GatewayAuth {
        gateway_secret: String,
    },
    ListBackends {},
    ConnectBackend {
        backend_id: String,
        api_key: String,
    },
    SendToBackend {
        backend_id: String,
        message: Value,
    },
}

/// Gateway → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToClient {
    GatewayAuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Gateway-assigned id, used for the `x-tether-client-id` tunnel header.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    BackendsList {
        backends: Vec<BackendSummary>,
    },
    BackendAuthResult {
        backend_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BackendDisconnected {
        backend_id: String,
    },
    BackendMessage {
        backend_id: String,
        message: Value,
    },
    GatewayError {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<String>,
    },
}

impl ToClient {
    /// Build a `gateway_error` envelope.
    pub fn error(
        code: crate::ErrorCode,
        message: impl Into<String>,
        backend_id: Option<&str>,
    ) -> Self {
        Self::GatewayError {
            code: code.as_str().to_string(),
            message: message.into(),
            backend_id: backend_id.map(str::to_string),
        }
    }

    /// Build a failed `backend_auth_result`.
    pub fn auth_failed(backend_id: &str, error: impl Into<String>) -> Self {
        Self::BackendAuthResult {
            backend_id: backend_id.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}
