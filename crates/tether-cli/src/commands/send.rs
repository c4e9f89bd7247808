//! `tether send <backend> <message>`: authorize against a backend, send one
//! message and print its reply.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;
use tether_client::ClientEvent;
use tracing::debug;

use super::Target;

/// Treat the argument as JSON when it parses, as a plain string otherwise.
pub fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn run(
    target: &Target,
    backend_id: &str,
    api_key: &str,
    message: &str,
    wait: Duration,
) -> Result<()> {
    let mut client = target.connect().await?;
    client
        .connect_backend(backend_id, api_key)
        .await
        .with_context(|| format!("authorizing against backend {backend_id} failed"))?;
    debug!(backend_id = %backend_id, client_id = %client.client_id(), "authorized");

    client.send_to_backend(backend_id, parse_message(message)).await?;

    let reply = tokio::time::timeout(wait, async {
        loop {
            match client.next_event().await {
                Some(ClientEvent::Message {
                    backend_id: from,
                    message,
                }) if from == backend_id => return Ok(message),
                Some(ClientEvent::Message { .. }) => continue,
                Some(ClientEvent::Error { code, message, .. }) => bail!("{code}: {message}"),
                Some(ClientEvent::BackendDisconnected { .. }) => bail!("backend disconnected"),
                Some(ClientEvent::Closed) | None => bail!("gateway closed the connection"),
            }
        }
    })
    .await;

    let outcome = match reply {
        Ok(Ok(message)) => {
            println!("{}", serde_json::to_string_pretty(&message)?);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("no reply within {}s", wait.as_secs())),
    };
    client.close().await;
    outcome
}
