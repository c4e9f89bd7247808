//! `tether backends`: list backends registered with the gateway.

use anyhow::{Context, Result};

use super::Target;

pub async fn run(target: &Target, json: bool) -> Result<()> {
    let client = target.connect().await?;
    let backends = client.list_backends().await.context("list_backends failed")?;
    client.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&backends)?);
        return Ok(());
    }

    if backends.is_empty() {
        println!("no backends registered");
        return Ok(());
    }
    println!("{:<22} {:<8} NAME", "BACKEND", "STATUS");
    for backend in &backends {
        let status = if backend.online { "online" } else { "offline" };
        println!("{:<22} {:<8} {}", backend.backend_id, status, backend.name);
    }
    Ok(())
}
