//! Terminate a sandbox.

use anyhow::Result;
use colored::Colorize;

use super::Backend;

pub async fn run(backend: &Backend, id: &str) -> Result<()> {
    backend.manager().kill_session(id).await?;
    println!("{} Sandbox {} terminated", "✓".green(), id.cyan());
    Ok(())
}
