//! Task-submission collaborator.
//!
//! Sandbox operations can be expressed as named task runs: the caller
//! triggers a task with a JSON payload, then polls the run until it reaches a
//! terminal status. [`TaskSessions`] wraps that round trip behind typed
//! methods; [`InlineTaskClient`] executes the runs in-process.

mod error;
mod handlers;
mod inline;

pub(crate) use error::TaskError;
pub(crate) use handlers::{SandboxTasks, TaskHandler};
pub(crate) use inline::InlineTaskClient;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::poll::{poll_until, PollError, PollPolicy};
use crate::session::{CommandOutcome, FileWrite, SessionInfo, SessionStatus};
use handlers::{
    CreateSandboxOutput, CreateSandboxPayload, FilePayload, RunCommandOutput, RunCommandPayload,
    SandboxStatusOutput, SandboxStatusPayload, SandboxUrlOutput, SandboxUrlPayload,
    WriteFilesOutput, WriteFilesPayload, CREATE_SANDBOX, GET_SANDBOX_STATUS, GET_SANDBOX_URL,
    RUN_COMMAND, WRITE_FILES,
};

/// Lifecycle status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum RunStatus {
    Queued,
    Executing,
    Completed,
    Failed,
    Crashed,
}

impl RunStatus {
    /// No further change happens once a run is terminal.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Crashed)
    }
}

/// Point-in-time view of a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RunSnapshot {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl RunSnapshot {
    pub(crate) fn queued() -> Self {
        Self::with_status(RunStatus::Queued)
    }

    pub(crate) fn executing() -> Self {
        Self::with_status(RunStatus::Executing)
    }

    pub(crate) fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_status(RunStatus::Completed)
        }
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(RunStatus::Failed)
        }
    }

    pub(crate) fn crashed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(RunStatus::Crashed)
        }
    }

    fn with_status(status: RunStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
        }
    }
}

/// Submits task runs and reports their progress.
#[async_trait]
pub(crate) trait TaskClient: Send + Sync {
    /// Starts a run of `task` and returns its run id.
    async fn trigger(&self, task: &str, payload: Value) -> Result<String, TaskError>;

    async fn retrieve(&self, run_id: &str) -> Result<RunSnapshot, TaskError>;
}

/// Triggers `task` and polls until the run is terminal, returning its output.
pub(crate) async fn trigger_and_wait(
    client: &dyn TaskClient,
    task: &str,
    payload: Value,
    policy: PollPolicy,
) -> Result<Value, TaskError> {
    let run_id = client.trigger(task, payload).await?;
    debug!("Triggered task {} as run {}", task, run_id);

    let run_id = run_id.as_str();
    let result = poll_until(policy, |attempt| async move {
        let run = client.retrieve(run_id).await?;
        debug!("Run {} is {:?} (poll {})", run_id, run.status, attempt);

        match run.status {
            RunStatus::Completed => Ok(Some(run.output)),
            RunStatus::Failed => Err(TaskError::task_failed(
                task,
                run.error.unwrap_or_else(|| "Task failed".to_string()),
            )),
            RunStatus::Crashed => Err(TaskError::task_crashed(
                task,
                run.error.unwrap_or_else(|| "Task crashed".to_string()),
            )),
            RunStatus::Queued | RunStatus::Executing => Ok(None),
        }
    })
    .await;

    match result {
        Ok(Some(output)) if !output.is_null() => Ok(output),
        Ok(_) => Err(TaskError::no_output(task)),
        Err(PollError::Timeout { attempts }) => Err(TaskError::timeout(task, attempts)),
        Err(PollError::Failed(e)) => Err(e),
    }
}

/// Session operations expressed as task submissions.
pub(crate) struct TaskSessions {
    client: Arc<dyn TaskClient>,
    policy: PollPolicy,
}

impl TaskSessions {
    pub(crate) fn new(client: Arc<dyn TaskClient>, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    pub(crate) async fn create(&self, timeout_ms: Option<u64>, ports: Vec<u16>) -> Result<SessionInfo, TaskError> {
        let payload = CreateSandboxPayload {
            timeout: timeout_ms,
            ports: Some(ports),
        };
        let output: CreateSandboxOutput = self.submit(CREATE_SANDBOX, &payload).await?;

        Ok(SessionInfo {
            session_id: output.sandbox_id,
            exposed_ports: output.ports,
            timeout_ms: output.timeout,
        })
    }

    /// An output without a command id means the command never started.
    pub(crate) async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        args: &[String],
        sudo: bool,
        wait: bool,
    ) -> Result<CommandOutcome, TaskError> {
        let payload = RunCommandPayload {
            sandbox_id: Some(sandbox_id.to_string()),
            command: Some(command.to_string()),
            args: Some(args.to_vec()),
            sudo: Some(sudo),
            wait: Some(wait),
        };
        let output: RunCommandOutput = self.submit(RUN_COMMAND, &payload).await?;

        match output.cmd_id {
            Some(command_id) => Ok(CommandOutcome {
                command_id,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            None => Err(TaskError::command_not_started(
                RUN_COMMAND,
                output
                    .error
                    .unwrap_or_else(|| "Failed to start command - no command ID returned".to_string()),
            )),
        }
    }

    pub(crate) async fn write(&self, sandbox_id: &str, files: &[FileWrite]) -> Result<(), TaskError> {
        let payload = WriteFilesPayload {
            sandbox_id: Some(sandbox_id.to_string()),
            files: Some(files.iter().map(FilePayload::from_write).collect()),
        };
        let output: WriteFilesOutput = self.submit(WRITE_FILES, &payload).await?;

        if output.success {
            Ok(())
        } else {
            Err(TaskError::task_failed(
                WRITE_FILES,
                output.error.unwrap_or_else(|| "Failed to write files".to_string()),
            ))
        }
    }

    pub(crate) async fn url(&self, sandbox_id: &str, port: u16) -> Result<String, TaskError> {
        let payload = SandboxUrlPayload {
            sandbox_id: Some(sandbox_id.to_string()),
            port: Some(port),
        };
        let output: SandboxUrlOutput = self.submit(GET_SANDBOX_URL, &payload).await?;

        output.url.ok_or_else(|| {
            TaskError::task_failed(
                GET_SANDBOX_URL,
                output.error.unwrap_or_else(|| "No URL returned".to_string()),
            )
        })
    }

    pub(crate) async fn status(&self, sandbox_id: &str, deep: bool) -> Result<SessionStatus, TaskError> {
        let payload = SandboxStatusPayload {
            sandbox_id: Some(sandbox_id.to_string()),
            deep: Some(deep),
        };
        let output: SandboxStatusOutput = self.submit(GET_SANDBOX_STATUS, &payload).await?;

        match output.status.as_str() {
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(TaskError::task_failed(
                GET_SANDBOX_STATUS,
                output
                    .error
                    .unwrap_or_else(|| format!("unexpected status {other}")),
            )),
        }
    }

    async fn submit<P: Serialize, O: DeserializeOwned>(&self, task: &str, payload: &P) -> Result<O, TaskError> {
        let payload = serde_json::to_value(payload).map_err(|e| TaskError::invalid_payload(task, e.to_string()))?;
        let output = trigger_and_wait(self.client.as_ref(), task, payload, self.policy).await?;
        serde_json::from_value(output)
            .map_err(|e| TaskError::client(format!("unexpected output from {task}: {e}")))
    }
}
