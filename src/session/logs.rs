//! Line-oriented replay of a command's captured output.
//!
//! All stdout lines come first, then all stderr lines. For a command that is
//! still running, stdout lines are produced as they arrive and stderr is
//! replayed once stdout has closed.

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, Stream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use super::executor::{Captured, CommandStore};
use super::SessionError;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LogLine {
    pub data: String,
    pub stream: StreamKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    fn new(data: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            data: data.into(),
            stream,
            timestamp: Utc::now(),
        }
    }

    /// One NDJSON record, newline included.
    pub(crate) fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Finite, non-restartable sequence of log lines.
pub(crate) type LogStream = BoxStream<'static, LogLine>;

/// Streams the output of `command_id`.
pub(crate) async fn stream_logs(store: &CommandStore, command_id: &str) -> Result<LogStream, SessionError> {
    let record = store
        .get(command_id)
        .await
        .ok_or_else(|| SessionError::command_not_found(command_id))?;

    let stdout = lines(record.stdout.subscribe(), StreamKind::Stdout, command_id.to_string());
    let stderr = lines(record.stderr.subscribe(), StreamKind::Stderr, command_id.to_string());
    Ok(stdout.chain(stderr).boxed())
}

/// Newline-delimited segments of one buffer, skipping empty ones.
fn lines(
    mut rx: watch::Receiver<Captured>,
    kind: StreamKind,
    command_id: String,
) -> impl Stream<Item = LogLine> + Send + 'static {
    async_stream::stream! {
        let mut cursor = 0;
        let mut partial = String::new();

        loop {
            let closed = {
                let captured = rx.borrow_and_update();
                partial.push_str(&captured.text[cursor..]);
                cursor = captured.text.len();
                captured.closed
            };

            while let Some(pos) = partial.find('\n') {
                let line: String = partial.drain(..=pos).collect();
                let line = line.strip_suffix('\n').unwrap_or(&line);
                if !line.is_empty() {
                    yield LogLine::new(line, kind);
                }
            }

            if closed {
                break;
            }
            if rx.changed().await.is_err() {
                warn!("Output of command {} went away mid-stream", command_id);
                break;
            }
        }

        if !partial.is_empty() {
            yield LogLine::new(partial, kind);
        }
    }
}
