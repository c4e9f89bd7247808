use thiserror::Error;

/// Errors produced by the tether protocol layer.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Bad gateway secret or rejected backend API key. Never says which.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Unknown backend id, client id or stale request id.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP tunnel deadline exceeded.
    #[error("timeout")]
    Timeout,

    /// Malformed envelope or unknown message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Protocol(e.to_string())
    }
}

pub type TetherResult<T> = Result<T, TetherError>;

/// Machine-readable codes carried in `gateway_error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotAuthenticated,
    ProtocolError,
    BackendNotFound,
    BackendOffline,
    BackendNotAuthenticated,
    RateLimited,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::BackendNotFound => "BACKEND_NOT_FOUND",
            Self::BackendOffline => "BACKEND_OFFLINE",
            Self::BackendNotAuthenticated => "BACKEND_NOT_AUTHENTICATED",
            Self::RateLimited => "RATE_LIMITED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
