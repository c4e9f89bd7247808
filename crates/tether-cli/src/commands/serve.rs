//! `tether serve`: run a demo backend behind the gateway.
//!
//! Clients holding the API key are admitted. Messages are echoed back and
//! tunneled HTTP calls go to `--upstream` when one is given.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_client::{
    BackendAgent, BackendConfig, BackendHandler, BoxFuture, LinkState, LocalHttpForwarder,
    Responder,
};
use tether_core::{HttpProxyRequest, HttpProxyResponse, SecretVerifier};
use tracing::info;

use super::Target;

pub struct ServeOptions {
    pub api_key: String,
    pub name: Option<String>,
    pub device_id: Option<String>,
    pub upstream: Option<String>,
}

struct EchoBackend {
    api_key: SecretVerifier,
    upstream: Option<LocalHttpForwarder>,
}

impl BackendHandler for EchoBackend {
    fn authenticate_client<'a>(
        &'a self,
        client_id: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            if self.api_key.verify(api_key) {
                info!(client_id = %client_id, "client admitted");
                Ok(())
            } else {
                info!(client_id = %client_id, "client rejected");
                Err("invalid API key".into())
            }
        })
    }

    fn on_client_disconnected<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(client_id = %client_id, "client left");
        })
    }

    fn on_forwarded<'a>(
        &'a self,
        client_id: &'a str,
        message: Value,
        responder: Responder,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            println!("{client_id}: {message}");
            let _ = responder.send(json!({"echo": message})).await;
        })
    }

    fn on_http_request(&self, request: HttpProxyRequest) -> BoxFuture<'_, HttpProxyResponse> {
        Box::pin(async move {
            match &self.upstream {
                Some(upstream) => upstream.forward(&request).await,
                None => HttpProxyResponse {
                    request_id: request.request_id,
                    status_code: 404,
                    headers: Default::default(),
                    body: "no upstream configured".into(),
                },
            }
        })
    }
}

pub async fn run(target: &Target, opts: ServeOptions) -> Result<()> {
    let upstream = opts
        .upstream
        .as_deref()
        .map(LocalHttpForwarder::new)
        .transpose()
        .context("invalid --upstream")?;

    let mut config = BackendConfig::new(target.url.clone(), target.secret.clone());
    config.name = opts.name;
    config.device_id = opts.device_id;
    config.proxy = target.proxy.clone();

    let handler = Arc::new(EchoBackend {
        api_key: SecretVerifier::new(&opts.api_key),
        upstream,
    });
    let handle = BackendAgent::new(config, handler).spawn();

    let mut state = handle.subscribe();
    let announce = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            if let LinkState::Online { backend_id } = current {
                println!("online as {backend_id}");
            }
        }
    });

    if handle.wait_for_backend_id(Duration::from_secs(10)).await.is_none() {
        info!("still waiting for the gateway");
    }

    let outcome = tokio::select! {
        outcome = handle.join() => outcome.context("backend agent stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };
    announce.abort();
    outcome
}
