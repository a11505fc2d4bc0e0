//! Stream a file out of a sandbox as raw bytes on stdout.

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;

use super::Backend;

pub async fn run(backend: &Backend, id: &str, path: &str) -> Result<()> {
    let mut chunks = backend.manager().read_file(id, path).await?;
    let mut stdout = tokio::io::stdout();

    while let Some(chunk) = chunks.try_next().await? {
        stdout
            .write_all(&chunk)
            .await
            .context("Failed to write to stdout")?;
    }
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(())
}
