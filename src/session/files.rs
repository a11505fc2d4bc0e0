//! File transfer into and out of a session.
//!
//! Native sessions use the provider's filesystem API. Command-only sessions
//! emulate it with shell commands: the content is base64 encoded, appended
//! to a staging file chunk by chunk, then decoded into place. Reads stream
//! a `base64` dump and decode it as it arrives.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Session, SessionError};
use crate::config::FilesConfig;
use crate::provider::{CommandApi, Completed, FileContent, FilesystemApi, ProcessEvent, ProviderError};

/// Lazily produced file content.
pub(crate) type FileStream = BoxStream<'static, Result<Bytes, SessionError>>;

/// One file to write.
#[derive(Debug, Clone)]
pub(crate) struct FileWrite {
    pub path: String,
    pub content: Bytes,
}

impl FileWrite {
    pub(crate) fn new(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

pub(crate) struct FileTransfer {
    chunk_size: usize,
    temp_dir: String,
}

impl FileTransfer {
    pub(crate) fn new(config: &FilesConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(4),
            temp_dir: config.temp_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Writes every file; the first failure fails the batch and names its path.
    ///
    /// Every write runs to completion before the batch reports, so no file
    /// is left half staged.
    pub(crate) async fn write(&self, session: &Session, files: &[FileWrite]) -> Result<(), SessionError> {
        let handle = session.handle()?;

        let results = match handle.filesystem() {
            Some(filesystem) => join_all(files.iter().map(|file| write_native(filesystem, file))).await,
            None => {
                debug!("Sandbox {} has no filesystem API, using shell fallback", session.id());
                let commands = handle.commands();
                join_all(files.iter().map(|file| self.write_fallback(session, commands, file))).await
            }
        };
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        ensure_open(session)
    }

    pub(crate) async fn read(&self, session: &Session, path: &str) -> Result<FileStream, SessionError> {
        let handle = session.handle()?;

        let stream = match handle.filesystem() {
            Some(filesystem) => read_native(filesystem, path).await?,
            None => read_fallback(handle.commands(), path).await?,
        };
        ensure_open(session)?;
        Ok(stream)
    }

    async fn write_fallback(
        &self,
        session: &Session,
        commands: &Arc<dyn CommandApi>,
        file: &FileWrite,
    ) -> Result<(), SessionError> {
        let path = file.path.as_str();

        if let Some(dir) = parent_dir(path) {
            if let Err(e) = sh(commands, &format!("mkdir -p {}", shell_quote(dir))).await {
                warn!("mkdir -p {} failed, continuing: {}", dir, describe(&e));
            }
        }

        let encoded = BASE64.encode(&file.content);
        let chunks = split_chunks(&encoded, self.chunk_size);
        let staging = self.staging_path();
        debug!("Writing {} via {} chunk(s) staged at {}", path, chunks.len(), staging);

        for (i, chunk) in chunks.iter().enumerate() {
            if session.is_closed() {
                remove_staging(commands, &staging).await;
                return Err(SessionError::session_closed(session.id()));
            }

            let redirect = if i == 0 { ">" } else { ">>" };
            let line = format!(
                "printf '%s' {} {} {}",
                shell_quote(chunk),
                redirect,
                shell_quote(&staging)
            );
            if let Err(e) = sh(commands, &line).await {
                remove_staging(commands, &staging).await;
                return Err(SessionError::file_write_failed(
                    path,
                    format!("chunk {}/{} failed: {}", i + 1, chunks.len(), describe(&e)),
                ));
            }
        }

        let decoded = sh(
            commands,
            &format!("base64 -d {} > {}", shell_quote(&staging), shell_quote(path)),
        )
        .await;
        remove_staging(commands, &staging).await;

        decoded
            .map(|_| ())
            .map_err(|e| SessionError::file_write_failed(path, describe(&e)))
    }

    fn staging_path(&self) -> String {
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}/sandman_write_{}_{}",
            self.temp_dir,
            chrono::Utc::now().timestamp_millis(),
            &random[..9]
        )
    }
}

/// Bytes first; if the backend refuses them, text once.
async fn write_native(filesystem: &Arc<dyn FilesystemApi>, file: &FileWrite) -> Result<(), SessionError> {
    let first = match filesystem
        .write(&file.path, FileContent::Bytes(file.content.clone()))
        .await
    {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    let Ok(text) = std::str::from_utf8(&file.content) else {
        return Err(SessionError::file_write_failed(&file.path, first.to_string()));
    };

    debug!("Byte write of {} failed ({}), retrying as text", file.path, first);
    filesystem
        .write(&file.path, FileContent::Text(text.to_string()))
        .await
        .map_err(|e| SessionError::file_write_failed(&file.path, e.to_string()))
}

async fn read_native(filesystem: &Arc<dyn FilesystemApi>, path: &str) -> Result<FileStream, SessionError> {
    let stream = filesystem.read(path).await.map_err(|e| {
        if e.is_file_not_found() {
            SessionError::file_not_found(path)
        } else {
            SessionError::file_read_failed(path, e.to_string())
        }
    })?;

    let path = path.to_string();
    Ok(stream
        .map(move |chunk| chunk.map_err(|e| SessionError::file_read_failed(&path, e.to_string())))
        .boxed())
}

/// Streams `base64` output of `path`, decoding it as it arrives.
async fn read_fallback(commands: &Arc<dyn CommandApi>, path: &str) -> Result<FileStream, SessionError> {
    let quoted = shell_quote(path);
    sh(commands, &format!("test -e {quoted}"))
        .await
        .map_err(|e| match e {
            ProviderError::Exit { .. } => SessionError::file_not_found(path),
            other => SessionError::file_read_failed(path, describe(&other)),
        })?;

    let process = commands
        .spawn(&sh_argv(&format!("base64 {quoted}")))
        .await
        .map_err(|e| SessionError::file_read_failed(path, e.to_string()))?;

    Ok(decode_base64_output(path.to_string(), process.events))
}

/// Decodes whole 4-character groups of streamed base64 output.
fn decode_base64_output(
    path: String,
    mut events: BoxStream<'static, Result<ProcessEvent, ProviderError>>,
) -> FileStream {
    async_stream::stream! {
        let mut pending = String::new();
        let mut stderr = String::new();

        while let Some(event) = events.next().await {
            match event {
                Ok(ProcessEvent::Stdout(text)) => {
                    pending.extend(text.chars().filter(|c| !c.is_ascii_whitespace()));
                    let whole = pending.len() - pending.len() % 4;
                    if whole == 0 {
                        continue;
                    }
                    let rest = pending.split_off(whole);
                    match BASE64.decode(&pending) {
                        Ok(bytes) => {
                            yield Ok(Bytes::from(bytes));
                        }
                        Err(e) => {
                            yield Err(SessionError::file_read_failed(&path, format!("invalid base64 output: {e}")));
                            return;
                        }
                    }
                    pending = rest;
                }
                Ok(ProcessEvent::Stderr(text)) => stderr.push_str(&text),
                Ok(ProcessEvent::Exit { code: 0, .. }) => {
                    if !pending.is_empty() {
                        yield Err(SessionError::file_read_failed(&path, "truncated base64 output"));
                    }
                    return;
                }
                Ok(ProcessEvent::Exit { status, .. }) => {
                    let detail = match stderr.trim() {
                        "" => status,
                        text => format!("{status}: {text}"),
                    };
                    yield Err(SessionError::file_read_failed(&path, detail));
                    return;
                }
                Err(e) => {
                    yield Err(SessionError::file_read_failed(&path, e.to_string()));
                    return;
                }
            }
        }

        yield Err(SessionError::file_read_failed(&path, "output ended before an exit status was reported"));
    }
    .boxed()
}

/// `SessionClosed` once the session was closed or replaced mid-operation.
fn ensure_open(session: &Session) -> Result<(), SessionError> {
    if session.is_closed() {
        return Err(SessionError::session_closed(session.id()));
    }
    Ok(())
}

fn sh_argv(line: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), line.to_string()]
}

async fn sh(commands: &Arc<dyn CommandApi>, line: &str) -> Result<Completed, ProviderError> {
    commands.run(&sh_argv(line)).await
}

async fn remove_staging(commands: &Arc<dyn CommandApi>, staging: &str) {
    if let Err(e) = sh(commands, &format!("rm -f {}", shell_quote(staging))).await {
        warn!("Failed to remove staging file {}: {}", staging, describe(&e));
    }
}

/// Stderr of a failed command when there is any, the error text otherwise.
fn describe(error: &ProviderError) -> String {
    match error {
        ProviderError::Exit {
            message, stderr, ..
        } if !stderr.trim().is_empty() => format!("{message}: {}", stderr.trim()),
        other => other.to_string(),
    }
}

/// Double-quotes `s` for POSIX sh.
pub(crate) fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Directory part of `path`, if there is one to create.
fn parent_dir(path: &str) -> Option<&str> {
    let (dir, _) = path.rsplit_once('/')?;
    (!dir.is_empty()).then_some(dir)
}

/// Splits ASCII `s` into pieces of at most `size` bytes. Empty input is one empty chunk.
fn split_chunks(s: &str, size: usize) -> Vec<&str> {
    if s.is_empty() {
        return vec![""];
    }
    s.as_bytes()
        .chunks(size)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect()
}
