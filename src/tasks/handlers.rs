//! Named tasks backed by the session manager.
//!
//! Payload and output shapes are shared with [`super::TaskSessions`], which
//! builds the payloads and reads the outputs on the caller side.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::TaskError;
use crate::session::{FileWrite, SessionManager};

pub(crate) const CREATE_SANDBOX: &str = "create-sandbox";
pub(crate) const RUN_COMMAND: &str = "run-command";
pub(crate) const WRITE_FILES: &str = "write-files";
pub(crate) const GET_SANDBOX_URL: &str = "get-sandbox-url";
pub(crate) const GET_SANDBOX_STATUS: &str = "get-sandbox-status";

const TASKS: [&str; 5] = [
    CREATE_SANDBOX,
    RUN_COMMAND,
    WRITE_FILES,
    GET_SANDBOX_URL,
    GET_SANDBOX_STATUS,
];

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSandboxPayload {
    /// Milliseconds.
    pub timeout: Option<u64>,
    pub ports: Option<Vec<u16>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSandboxOutput {
    pub sandbox_id: String,
    pub ports: Vec<u16>,
    pub timeout: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunCommandPayload {
    pub sandbox_id: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub sudo: Option<bool>,
    pub wait: Option<bool>,
}

/// `cmd_id` is always serialized, as `null` when the command never started.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunCommandOutput {
    pub cmd_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FilePayload {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: FileEncoding,
}

impl FilePayload {
    /// Text content travels as-is, anything else as base64.
    pub(crate) fn from_write(file: &FileWrite) -> Self {
        match std::str::from_utf8(&file.content) {
            Ok(text) => Self {
                path: file.path.clone(),
                content: text.to_string(),
                encoding: FileEncoding::Utf8,
            },
            Err(_) => Self {
                path: file.path.clone(),
                content: STANDARD.encode(&file.content),
                encoding: FileEncoding::Base64,
            },
        }
    }

    fn into_write(self) -> Result<FileWrite, String> {
        match self.encoding {
            FileEncoding::Utf8 => Ok(FileWrite::new(self.path, self.content)),
            FileEncoding::Base64 => {
                let bytes = STANDARD
                    .decode(self.content.as_bytes())
                    .map_err(|e| format!("{}: invalid base64 content: {e}", self.path))?;
                Ok(FileWrite::new(self.path, bytes))
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteFilesPayload {
    pub sandbox_id: Option<String>,
    pub files: Option<Vec<FilePayload>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WriteFilesOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxUrlPayload {
    pub sandbox_id: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SandboxUrlOutput {
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxStatusPayload {
    pub sandbox_id: Option<String>,
    pub deep: Option<bool>,
}

/// `status` is `running`, `stopped`, or `unknown` for a malformed request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SandboxStatusOutput {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Executes named tasks.
#[async_trait]
pub(crate) trait TaskHandler: Send + Sync {
    fn handles(&self, task: &str) -> bool;

    async fn handle(&self, task: &str, payload: Value) -> Result<Value, TaskError>;
}

/// The sandbox task set.
pub(crate) struct SandboxTasks {
    manager: Arc<SessionManager>,
}

impl SandboxTasks {
    pub(crate) fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    async fn create_sandbox(&self, payload: CreateSandboxPayload) -> Result<Value, TaskError> {
        let info = self
            .manager
            .create_session(payload.timeout, payload.ports.unwrap_or_default())
            .await
            .map_err(|e| TaskError::task_failed(CREATE_SANDBOX, e.to_string()))?;

        to_output(&CreateSandboxOutput {
            sandbox_id: info.session_id,
            ports: info.exposed_ports,
            timeout: info.timeout_ms,
        })
    }

    async fn run_command(&self, payload: RunCommandPayload) -> Result<Value, TaskError> {
        let (Some(sandbox_id), Some(command)) = (payload.sandbox_id, payload.command) else {
            return to_output(&RunCommandOutput {
                error: Some(
                    "sandboxId and command are required. Example: { sandboxId: 'sbx_xxx', command: 'npm', args: ['install'] }"
                        .to_string(),
                ),
                ..Default::default()
            });
        };

        let args = payload.args.unwrap_or_default();
        let result = self
            .manager
            .run_command(
                &sandbox_id,
                &command,
                &args,
                payload.sudo.unwrap_or(false),
                payload.wait.unwrap_or(false),
            )
            .await;

        let output = match result {
            Ok(outcome) => RunCommandOutput {
                cmd_id: Some(outcome.command_id),
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: None,
            },
            Err(e) => {
                warn!("{} in sandbox {} failed: {}", RUN_COMMAND, sandbox_id, e);
                RunCommandOutput {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        to_output(&output)
    }

    async fn write_files(&self, payload: WriteFilesPayload) -> Result<Value, TaskError> {
        let failure = |error: String| {
            to_output(&WriteFilesOutput {
                success: false,
                error: Some(error),
            })
        };

        let Some(sandbox_id) = payload.sandbox_id else {
            return failure("sandboxId is required".to_string());
        };
        let files = match payload.files {
            Some(files) if !files.is_empty() => files,
            _ => return failure("files array is required and must not be empty".to_string()),
        };

        let writes = match files
            .into_iter()
            .map(FilePayload::into_write)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(writes) => writes,
            Err(e) => return failure(e),
        };

        match self.manager.write_files(&sandbox_id, &writes).await {
            Ok(()) => to_output(&WriteFilesOutput {
                success: true,
                error: None,
            }),
            Err(e) => failure(e.to_string()),
        }
    }

    async fn get_sandbox_url(&self, payload: SandboxUrlPayload) -> Result<Value, TaskError> {
        let (Some(sandbox_id), Some(port)) = (payload.sandbox_id, payload.port) else {
            return to_output(&SandboxUrlOutput {
                url: None,
                error: Some(
                    "sandboxId and port are required. Common ports: 3000 (Next.js), 8000 (Python), 5000 (Flask)"
                        .to_string(),
                ),
            });
        };

        let output = match self.manager.resolve_url(&sandbox_id, port).await {
            Ok(url) => SandboxUrlOutput {
                url: Some(url),
                error: None,
            },
            Err(e) => SandboxUrlOutput {
                url: None,
                error: Some(e.to_string()),
            },
        };
        to_output(&output)
    }

    async fn get_sandbox_status(&self, payload: SandboxStatusPayload) -> Result<Value, TaskError> {
        let Some(sandbox_id) = payload.sandbox_id else {
            return to_output(&SandboxStatusOutput {
                status: "unknown".to_string(),
                error: Some("sandboxId is required".to_string()),
            });
        };

        let status = self
            .manager
            .status(&sandbox_id, payload.deep.unwrap_or(false))
            .await;
        to_output(&SandboxStatusOutput {
            status: status.to_string(),
            error: None,
        })
    }
}

#[async_trait]
impl TaskHandler for SandboxTasks {
    fn handles(&self, task: &str) -> bool {
        TASKS.contains(&task)
    }

    async fn handle(&self, task: &str, payload: Value) -> Result<Value, TaskError> {
        debug!("Handling task {}", task);
        match task {
            CREATE_SANDBOX => self.create_sandbox(parse(task, payload)?).await,
            RUN_COMMAND => self.run_command(parse(task, payload)?).await,
            WRITE_FILES => self.write_files(parse(task, payload)?).await,
            GET_SANDBOX_URL => self.get_sandbox_url(parse(task, payload)?).await,
            GET_SANDBOX_STATUS => self.get_sandbox_status(parse(task, payload)?).await,
            _ => Err(TaskError::unknown_task(task)),
        }
    }
}

/// A `null` payload stands for an empty one.
fn parse<T: DeserializeOwned + Default>(task: &str, payload: Value) -> Result<T, TaskError> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|e| TaskError::invalid_payload(task, e.to_string()))
}

fn to_output<T: Serialize>(output: &T) -> Result<Value, TaskError> {
    serde_json::to_value(output).map_err(|e| TaskError::client(e.to_string()))
}
