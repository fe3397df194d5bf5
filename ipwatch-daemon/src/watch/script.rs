use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use ipwatch_engine::notify::ConflictEvent;
use tokio::process::Command;

/// Runs the user script for a new conflict as `<script> <device> <ip> <foreign mac>`
/// and waits for it to exit.
pub async fn run_script(script: &Path, event: &ConflictEvent) -> Result<()> {
    tracing::debug!("running user script {:?} for {}", script, event.ip);
    let status = Command::new(script)
        .arg(&event.device)
        .arg(&event.ip)
        .arg(&event.foreign_mac)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow!("failed to exec user script {:?} : {:?}", script, e))?;
    if !status.success() {
        return Err(anyhow!("user script {:?} exited with {}", script, status));
    }
    Ok(())
}
