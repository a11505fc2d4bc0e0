//! Command execution and the command store.
//!
//! Every dispatched command gets a [`CommandRecord`] keyed by its command id.
//! Output lands in watch-backed buffers so log streamers can follow a command
//! that is still running; exit information is written exactly once.

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::{Session, SessionError};
use crate::provider::{ProcessEvent, ProviderError};

/// Text captured so far on one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Captured {
    pub text: String,
    /// No more text will be appended.
    pub closed: bool,
}

/// Append-only output buffer with change notification.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    tx: watch::Sender<Captured>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(Captured::default()),
        }
    }
}

impl OutputBuffer {
    pub(crate) fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.tx.send_modify(|captured| captured.text.push_str(text));
    }

    pub(crate) fn close(&self) {
        self.tx.send_if_modified(|captured| !std::mem::replace(&mut captured.closed, true));
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Captured {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Captured> {
        self.tx.subscribe()
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub exit_code: Option<i32>,
    /// Provider diagnostic: the exit status text, or why the command failed.
    pub error_text: Option<String>,
}

/// Stored state of one dispatched command.
#[derive(Debug)]
pub(crate) struct CommandRecord {
    pub id: String,
    pub sandbox_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    exit: OnceLock<ExitInfo>,
}

impl CommandRecord {
    pub(super) fn new(id: String, sandbox_id: &str, argv: &[String]) -> Self {
        Self {
            id,
            sandbox_id: sandbox_id.to_string(),
            command: shell_words::join(argv),
            started_at: Utc::now(),
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            exit: OnceLock::new(),
        }
    }

    /// Records the exit. Later calls are ignored.
    pub(super) fn finish(&self, info: ExitInfo) {
        if self.exit.set(info).is_err() {
            debug!("Exit for command {} already recorded", self.id);
        }
        self.stdout.close();
        self.stderr.close();
    }

    pub(crate) fn exit(&self) -> Option<&ExitInfo> {
        self.exit.get()
    }

    pub(crate) fn status(&self) -> CommandStatus {
        let exit = self.exit();
        CommandStatus {
            command_id: self.id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            command: self.command.clone(),
            started_at: self.started_at,
            exit_code: exit.and_then(|e| e.exit_code),
            error_text: exit.and_then(|e| e.error_text.clone()),
            running: exit.is_none(),
        }
    }
}

/// Polling view of a command record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommandStatus {
    pub command_id: String,
    pub sandbox_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub error_text: Option<String>,
    pub running: bool,
}

/// Caller-facing result of `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommandOutcome {
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Command records for the lifetime of the process. Entries are never evicted.
#[derive(Default)]
pub(crate) struct CommandStore {
    records: RwLock<HashMap<String, Arc<CommandRecord>>>,
}

impl CommandStore {
    pub(crate) async fn get(&self, id: &str) -> Option<Arc<CommandRecord>> {
        self.records.read().await.get(id).cloned()
    }

    /// Inserts a record under `preferred`, or under a fresh synthesized id if
    /// `preferred` is absent or taken.
    pub(super) async fn insert(
        &self,
        preferred: Option<String>,
        make: impl FnOnce(String) -> CommandRecord,
    ) -> Arc<CommandRecord> {
        let mut records = self.records.write().await;

        let id = match preferred.filter(|id| !records.contains_key(id)) {
            Some(id) => id,
            None => loop {
                let candidate = synthesize_command_id();
                if !records.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let record = Arc::new(make(id.clone()));
        records.insert(id, record.clone());
        record
    }

    async fn remove(&self, id: &str) {
        self.records.write().await.remove(id);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

/// `cmd_<millis>_<9 random chars>`.
fn synthesize_command_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("cmd_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

/// Extracts `N` from provider status text such as `exit status N`.
pub(crate) fn parse_exit_status(message: &str) -> Option<i32> {
    let lower = message.to_lowercase();
    let (_, rest) = lower.split_once("exit status")?;
    let rest = rest.trim_start_matches(':').trim_start();
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    rest[..end].parse().ok()
}

/// Runs commands and records them in the [`CommandStore`].
pub(crate) struct Executor {
    store: Arc<CommandStore>,
}

impl Executor {
    pub(crate) fn new(store: Arc<CommandStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &Arc<CommandStore> {
        &self.store
    }

    /// Runs `command args...` in `session`.
    ///
    /// With `wait`, blocks until completion; a non-zero exit is a normal
    /// outcome carrying the exit code. Without `wait`, returns once the
    /// process started with only the command id set.
    pub(crate) async fn run(
        &self,
        session: &Session,
        command: &str,
        args: &[String],
        sudo: bool,
        wait: bool,
    ) -> Result<CommandOutcome, SessionError> {
        let commands = session.handle()?.commands().clone();

        let mut argv = Vec::with_capacity(args.len() + 2);
        if sudo {
            argv.push("sudo".to_string());
        }
        argv.push(command.to_string());
        argv.extend_from_slice(args);
        let line = shell_words::join(&argv);

        info!("Running `{}` in sandbox {} (wait: {})", line, session.id(), wait);

        if !wait {
            let process = commands
                .spawn(&argv)
                .await
                .map_err(|e| SessionError::command_start_failed(&line, e.to_string()))?;

            let record = self
                .store
                .insert(process.pid.clone(), |id| CommandRecord::new(id, session.id(), &argv))
                .await;
            debug!("Command {} started in background", record.id);

            tokio::spawn(pump(record.clone(), process.events));

            return Ok(CommandOutcome {
                command_id: record.id.clone(),
                exit_code: None,
                stdout: None,
                stderr: None,
            });
        }

        let record = self
            .store
            .insert(None, |id| CommandRecord::new(id, session.id(), &argv))
            .await;

        // The remote command keeps running if the caller stops waiting; the
        // spawned task still records its result.
        let task_record = record.clone();
        let task = tokio::spawn(async move {
            let result = commands.run(&argv).await;
            record_completion(&task_record, &result);
            result
        });

        let result = task
            .await
            .map_err(|e| SessionError::command_failed(&line, e.to_string()))?;

        // The result stays in the store for later retrieval.
        if session.is_closed() {
            debug!("Sandbox {} was closed while {} ran", session.id(), record.id);
            return Err(SessionError::session_closed(session.id()));
        }

        match result {
            Ok(completed) => Ok(CommandOutcome {
                command_id: record.id.clone(),
                exit_code: Some(0),
                stdout: Some(completed.stdout),
                stderr: Some(completed.stderr),
            }),
            Err(ProviderError::Exit {
                message,
                stdout,
                stderr,
            }) => {
                let code = parse_exit_status(&message).unwrap_or(1);
                debug!("Command {} exited with {}", record.id, code);
                Ok(CommandOutcome {
                    command_id: record.id.clone(),
                    exit_code: Some(code),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                })
            }
            Err(e) if e.is_spawn() => {
                self.store.remove(&record.id).await;
                Err(SessionError::command_start_failed(&line, e.to_string()))
            }
            Err(e) => Err(SessionError::command_failed(&line, e.to_string())),
        }
    }

    pub(crate) async fn status(&self, command_id: &str) -> Result<CommandStatus, SessionError> {
        self.store
            .get(command_id)
            .await
            .map(|record| record.status())
            .ok_or_else(|| SessionError::command_not_found(command_id))
    }
}

fn record_completion(record: &CommandRecord, result: &Result<crate::provider::Completed, ProviderError>) {
    let info = match result {
        Ok(completed) => {
            record.stdout.append(&completed.stdout);
            record.stderr.append(&completed.stderr);
            ExitInfo {
                exit_code: Some(0),
                error_text: None,
            }
        }
        Err(ProviderError::Exit {
            message,
            stdout,
            stderr,
        }) => {
            record.stdout.append(stdout);
            record.stderr.append(stderr);
            ExitInfo {
                exit_code: Some(parse_exit_status(message).unwrap_or(1)),
                error_text: Some(message.clone()),
            }
        }
        Err(e) => ExitInfo {
            exit_code: None,
            error_text: Some(e.to_string()),
        },
    };
    record.finish(info);
}

/// Feeds a background process's events into its record.
async fn pump(
    record: Arc<CommandRecord>,
    mut events: BoxStream<'static, Result<ProcessEvent, ProviderError>>,
) {
    while let Some(event) = events.next().await {
        match event {
            Ok(ProcessEvent::Stdout(text)) => record.stdout.append(&text),
            Ok(ProcessEvent::Stderr(text)) => record.stderr.append(&text),
            Ok(ProcessEvent::Exit { code, status }) => {
                debug!("Command {} exited with {}", record.id, code);
                record.finish(ExitInfo {
                    exit_code: Some(code),
                    error_text: (code != 0).then_some(status),
                });
                return;
            }
            Err(e) => {
                warn!("Output stream for command {} failed: {}", record.id, e);
                record.finish(ExitInfo {
                    exit_code: None,
                    error_text: Some(e.to_string()),
                });
                return;
            }
        }
    }

    record.finish(ExitInfo {
        exit_code: None,
        error_text: Some("output ended before an exit status was reported".to_string()),
    });
}
