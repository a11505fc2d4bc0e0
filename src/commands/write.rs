//! Write one file into a sandbox.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use tokio::io::AsyncReadExt;

use super::Backend;
use crate::session::FileWrite;

/// Format a completed write for humans
pub fn format_written(path: &str, len: usize) -> String {
    format!("{} Wrote {} ({} bytes)\n", "✓".green(), path.cyan(), len)
}

/// Content comes from `from`, or from stdin when absent.
pub async fn run(backend: &Backend, id: &str, path: &str, from: Option<&Path>) -> Result<()> {
    let content = match from {
        Some(source) => tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read stdin")?;
            buf
        }
    };

    let len = content.len();
    backend.write(id, &[FileWrite::new(path, content)]).await?;
    print!("{}", format_written(path, len));
    Ok(())
}
