//! CLI subcommand implementations.

pub mod backends;
pub mod send;
pub mod serve;

use anyhow::{Context, Result};
use tether_client::{GatewayClient, ProxyConfig};

/// Where and how to reach the gateway, after merging flags and config.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub secret: String,
    pub proxy: Option<ProxyConfig>,
}

impl Target {
    pub fn resolve(url: String, secret: Option<String>, proxy: Option<String>) -> Result<Self> {
        let secret = secret.context(
            "no gateway secret: pass --secret, set TETHER_SECRET or add `secret` to [default]",
        )?;
        let proxy = proxy
            .as_deref()
            .map(ProxyConfig::parse)
            .transpose()
            .context("invalid --proxy")?;
        Ok(Self { url, secret, proxy })
    }

    pub async fn connect(&self) -> Result<GatewayClient> {
        GatewayClient::connect_with(&self.url, &self.secret, self.proxy.as_ref())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))
    }
}
