//! Gateway configuration: TOML file + CLI/env overrides.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backend_port: default_backend_port(),
            client_port: default_client_port(),
            http_port: default_http_port(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Secret backends present in `register`.
    pub gateway_secret: Option<String>,
    /// Secret clients present in `gateway_auth`. Defaults to `gateway_secret`.
    pub client_secret: Option<String>,
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_backend_auth_timeout")]
    pub backend_auth_timeout_secs: u64,
    #[serde(default = "default_offline_grace")]
    pub offline_grace_secs: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_auth_failures")]
    pub auth_failures_per_minute: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout(),
            backend_auth_timeout_secs: default_backend_auth_timeout(),
            offline_grace_secs: default_offline_grace(),
            outbound_queue: default_outbound_queue(),
            auth_failures_per_minute: default_auth_failures(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_backend_port() -> u16 {
    7400
}
fn default_client_port() -> u16 {
    7401
}
fn default_http_port() -> u16 {
    7402
}
fn default_http_timeout() -> u64 {
    30
}
fn default_backend_auth_timeout() -> u64 {
    30
}
fn default_offline_grace() -> u64 {
    300
}
fn default_outbound_queue() -> usize {
    256
}
fn default_auth_failures() -> u32 {
    5
}

/// Values given on the command line or in the environment. `None` keeps the
/// file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub backend_port: Option<u16>,
    pub client_port: Option<u16>,
    pub http_port: Option<u16>,
    pub gateway_secret: Option<String>,
    pub client_secret: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub offline_grace_secs: Option<u64>,
}

/// Resolved gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    pub backend_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub registration_secret: String,
    pub admission_secret: String,
    pub http_timeout: Duration,
    pub backend_auth_timeout: Duration,
    pub offline_grace: Duration,
    pub outbound_queue: usize,
    pub auth_failures_per_minute: u32,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("backend_addr", &self.backend_addr)
            .field("client_addr", &self.client_addr)
            .field("http_addr", &self.http_addr)
            .field("http_timeout", &self.http_timeout)
            .field("offline_grace", &self.offline_grace)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Defaults with the given secret, used for both backends and clients.
    pub fn with_secret(secret: &str) -> Self {
        Self::build(ConfigFile::default(), ConfigOverrides::default(), secret.to_string())
    }

    /// Same as [`with_secret`](Self::with_secret) but bound to ephemeral
    /// loopback ports.
    pub fn local(secret: &str) -> Self {
        let mut cfg = Self::with_secret(secret);
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.backend_addr = SocketAddr::new(lo, 0);
        cfg.client_addr = SocketAddr::new(lo, 0);
        cfg.http_addr = SocketAddr::new(lo, 0);
        cfg
    }

    /// Load config from a TOML file (if present), then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TetherResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TetherError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, o: ConfigOverrides) -> TetherResult<Self> {
        let registration_secret = o
            .gateway_secret
            .clone()
            .or_else(|| file.auth.gateway_secret.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                TetherError::Config(
                    "no gateway secret configured (set [auth] gateway_secret or TETHER_GATEWAY_SECRET)"
                        .into(),
                )
            })?;
        Ok(Self::build(file, o, registration_secret))
    }

    fn build(file: ConfigFile, o: ConfigOverrides, registration_secret: String) -> Self {
        let admission_secret = o
            .client_secret
            .or(file.auth.client_secret)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| registration_secret.clone());

        let bind = o.bind.unwrap_or(file.server.bind);
        let limits = file.limits;

        Self {
            backend_addr: SocketAddr::new(bind, o.backend_port.unwrap_or(file.server.backend_port)),
            client_addr: SocketAddr::new(bind, o.client_port.unwrap_or(file.server.client_port)),
            http_addr: SocketAddr::new(bind, o.http_port.unwrap_or(file.server.http_port)),
            registration_secret,
            admission_secret,
            http_timeout: Duration::from_secs(o.http_timeout_secs.unwrap_or(limits.http_timeout_secs)),
            backend_auth_timeout: Duration::from_secs(limits.backend_auth_timeout_secs),
            offline_grace: Duration::from_secs(
                o.offline_grace_secs.unwrap_or(limits.offline_grace_secs),
            ),
            outbound_queue: limits.outbound_queue.max(1),
            auth_failures_per_minute: limits.auth_failures_per_minute.max(1),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
