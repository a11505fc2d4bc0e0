//! Host-process provider.
//!
//! Each sandbox is a directory under the configured root plus a JSON
//! metadata file next to it. Nothing is isolated: commands are ordinary host
//! processes running with the sandbox directory as working directory.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ByteStream, CommandApi, CreateRequest, FileContent, FilesystemApi, Process, ProcessEvent,
    ProviderError, RemoteSandbox, SandboxProvider, Utf8Decoder,
};

const READ_CHUNK: usize = 8192;

/// Persisted next to each sandbox directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxMeta {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    ports: Vec<u16>,
}

/// Provider backed by host directories.
pub(crate) struct LocalProvider {
    root: PathBuf,
    native_filesystem: bool,
}

impl LocalProvider {
    pub(crate) fn new(root: PathBuf, native_filesystem: bool) -> Self {
        Self {
            root,
            native_filesystem,
        }
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn sandbox(&self, id: &str) -> Arc<dyn RemoteSandbox> {
        Arc::new(LocalSandbox {
            id: id.to_string(),
            dir: self.root.join(id),
            meta_path: self.meta_path(id),
            native_filesystem: self.native_filesystem,
        })
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, request: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("local-{}", &short[..12]);
        let dir = self.root.join(&id);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ProviderError::other(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(request.timeout)
            .map_err(|e| ProviderError::other(format!("Invalid sandbox timeout: {e}")))?;
        let meta = SandboxMeta {
            id: id.clone(),
            created_at,
            expires_at: created_at + ttl,
            ports: request.ports.clone(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| ProviderError::other(format!("Failed to encode metadata: {e}")))?;
        tokio::fs::write(self.meta_path(&id), json)
            .await
            .map_err(|e| ProviderError::other(format!("Failed to write metadata: {e}")))?;

        debug!("Created local sandbox {} in {}", id, dir.display());
        Ok(self.sandbox(&id))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let not_found = || ProviderError::unavailable(format!("Sandbox {sandbox_id} not found"));

        // Ids are directory names; reject anything that could escape the root.
        if sandbox_id.is_empty() || sandbox_id.contains(['/', '\\']) || sandbox_id.starts_with('.') {
            return Err(not_found());
        }

        let raw = tokio::fs::read(self.meta_path(sandbox_id))
            .await
            .map_err(|_| not_found())?;
        let meta: SandboxMeta = serde_json::from_slice(&raw)
            .map_err(|e| ProviderError::other(format!("Corrupt metadata for {sandbox_id}: {e}")))?;

        if meta.expires_at <= Utc::now() {
            debug!("Local sandbox {} expired at {}", sandbox_id, meta.expires_at);
            return Err(ProviderError::unavailable(format!(
                "Sandbox {sandbox_id} not found (expired)"
            )));
        }

        Ok(self.sandbox(sandbox_id))
    }
}

struct LocalSandbox {
    id: String,
    dir: PathBuf,
    meta_path: PathBuf,
    native_filesystem: bool,
}

#[async_trait]
impl RemoteSandbox for LocalSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn commands(&self) -> Option<Arc<dyn CommandApi>> {
        Some(Arc::new(LocalCommands {
            dir: self.dir.clone(),
        }))
    }

    async fn filesystem(&self) -> Option<Arc<dyn FilesystemApi>> {
        if !self.native_filesystem {
            return None;
        }
        Some(Arc::new(LocalFilesystem {
            dir: self.dir.clone(),
        }))
    }

    async fn hostname(&self, port: u16) -> Result<String, ProviderError> {
        Ok(format!("localhost:{port}"))
    }

    async fn kill(&self) -> Result<(), ProviderError> {
        if let Err(e) = tokio::fs::remove_file(&self.meta_path).await {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Err(ProviderError::unavailable(format!("Sandbox {} not found", self.id)));
            }
            return Err(ProviderError::other(format!("Failed to remove metadata: {e}")));
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!("Failed to remove sandbox directory {}: {}", self.dir.display(), e);
        }
        Ok(())
    }
}

struct LocalCommands {
    dir: PathBuf,
}

#[async_trait]
impl CommandApi for LocalCommands {
    async fn spawn(&self, argv: &[String]) -> Result<Process, ProviderError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProviderError::spawn("empty command"))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::spawn(format!("{program}: {e}")))?;

        let pid = child.id().map(|pid| pid.to_string());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let out = tokio::spawn(pump(stdout, tx.clone(), ProcessEvent::Stdout));
            let err = tokio::spawn(pump(stderr, tx.clone(), ProcessEvent::Stderr));
            let _ = out.await;
            let _ = err.await;

            let event = match child.wait().await {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    Ok(ProcessEvent::Exit {
                        code,
                        status: format!("exit status {code}"),
                    })
                }
                Err(e) => Err(ProviderError::other(format!("Failed to wait for process: {e}"))),
            };
            let _ = tx.send(event).await;
        });

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(Process { pid, events })
    }
}

/// Forwards one pipe to the event channel until EOF.
async fn pump<R>(
    reader: Option<R>,
    tx: mpsc::Sender<Result<ProcessEvent, ProviderError>>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() && tx.send(Ok(wrap(text))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(Err(ProviderError::connection(format!("Failed to read output: {e}"))))
                    .await;
                return;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(Ok(wrap(rest))).await;
    }
}

struct LocalFilesystem {
    dir: PathBuf,
}

impl LocalFilesystem {
    /// Relative paths live inside the sandbox directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

#[async_trait]
impl FilesystemApi for LocalFilesystem {
    async fn write(&self, path: &str, content: FileContent) -> Result<(), ProviderError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProviderError::other(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&target, content.into_bytes())
            .await
            .map_err(|e| ProviderError::other(format!("Failed to write {path}: {e}")))
    }

    async fn read(&self, path: &str) -> Result<ByteStream, ProviderError> {
        let file = match tokio::fs::File::open(self.resolve(path)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::file_not_found(path));
            }
            Err(e) => return Err(ProviderError::other(format!("Failed to open {path}: {e}"))),
        };

        let path = path.to_string();
        let chunks = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| ProviderError::other(format!("Failed to read {path}: {e}")))?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };
        Ok(chunks.boxed())
    }
}
