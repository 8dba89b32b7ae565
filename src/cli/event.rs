//! Event command - feed a webhook payload to the engine

use crate::cli::context::CommandContext;
use crate::cli::style::check;
use anstream::println;
use mergebot::error::{Error, Result};
use mergebot::events;
use std::path::Path;
use tokio::io::AsyncReadExt;

async fn read_payload(path: &Path) -> Result<serde_json::Value> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(path).await?
    };
    serde_json::from_str(&raw).map_err(|e| Error::Payload(format!("{}: {e}", path.display())))
}

/// Handle one delivery, then persist the store
pub async fn run_event(path: &Path, kind: &str, payload: &Path) -> Result<()> {
    let ctx = CommandContext::new(path).await?;
    let payload = read_payload(payload).await?;
    let outcome = events::handle(&ctx.engine, kind, &payload).await?;
    ctx.engine.store().flush()?;
    println!("{} {outcome}", check());
    Ok(())
}
