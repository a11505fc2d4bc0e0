//! CLI command implementations.
//!
//! Each submodule implements one `sandman` subcommand. Formatting is pure and
//! tested; IO happens only in each module's `run`.

pub mod create;
pub mod exec;
pub mod kill;
pub mod read;
pub mod status;
pub mod url;
pub mod write;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::provider;
use crate::session::{
    CommandOutcome, CommandStore, FileWrite, SessionError, SessionInfo, SessionManager, SessionStatus,
};
use crate::tasks::{InlineTaskClient, SandboxTasks, TaskError, TaskSessions};

/// Where session operations are sent: straight to the manager, or through
/// task submissions executed in-process.
pub struct Backend {
    manager: Arc<SessionManager>,
    tasks: Option<TaskSessions>,
}

impl Backend {
    /// Builds the backend from `config_path`, or `./sandman.toml`.
    pub fn load(config_path: Option<&Path>, via_tasks: bool) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path)?,
            None => {
                let cwd = std::env::current_dir().context("Failed to get current directory")?;
                Config::load(&cwd)?
            }
        };
        Self::from_config(&config, via_tasks)
    }

    pub(crate) fn from_config(config: &Config, via_tasks: bool) -> Result<Self> {
        let provider = provider::from_config(config)?;
        debug!("Using {} provider", provider.name());

        let manager = Arc::new(SessionManager::new(
            provider,
            config,
            Arc::new(CommandStore::default()),
        ));

        let tasks = via_tasks.then(|| {
            let client = InlineTaskClient::new(Arc::new(SandboxTasks::new(manager.clone())));
            TaskSessions::new(Arc::new(client), config.tasks.poll_policy())
        });

        Ok(Self { manager, tasks })
    }

    pub(crate) fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub(crate) async fn create(&self, timeout_ms: Option<u64>, ports: Vec<u16>) -> Result<SessionInfo> {
        let info = match &self.tasks {
            Some(tasks) => tasks.create(timeout_ms, ports).await?,
            None => self.manager.create_session(timeout_ms, ports).await?,
        };
        Ok(info)
    }

    pub(crate) async fn run(
        &self,
        id: &str,
        command: &str,
        args: &[String],
        sudo: bool,
        wait: bool,
    ) -> Result<CommandOutcome> {
        let outcome = match &self.tasks {
            Some(tasks) => tasks.run(id, command, args, sudo, wait).await?,
            None => self.manager.run_command(id, command, args, sudo, wait).await?,
        };
        Ok(outcome)
    }

    pub(crate) async fn write(&self, id: &str, files: &[FileWrite]) -> Result<()> {
        match &self.tasks {
            Some(tasks) => tasks.write(id, files).await?,
            None => self.manager.write_files(id, files).await?,
        }
        Ok(())
    }

    pub(crate) async fn url(&self, id: &str, port: u16) -> Result<String> {
        let url = match &self.tasks {
            Some(tasks) => tasks.url(id, port).await?,
            None => self.manager.resolve_url(id, port).await?,
        };
        Ok(url)
    }

    pub(crate) async fn status(&self, id: &str, deep: bool) -> Result<SessionStatus> {
        let status = match &self.tasks {
            Some(tasks) => tasks.status(id, deep).await?,
            None => self.manager.status(id, deep).await,
        };
        Ok(status)
    }
}

/// Actionable follow-up for well-known failures
pub fn hint(error: &anyhow::Error) -> Option<&'static str> {
    if let Some(e) = error.downcast_ref::<SessionError>() {
        if e.is_sandbox_unavailable() {
            return Some("Run `sandman create` to start a new sandbox.");
        }
        if e.is_provider_unavailable() {
            return Some("Set E2B_API_KEY or pick another [provider] kind in sandman.toml.");
        }
        if e.is_connection_failed() || e.is_session_closed() {
            return Some("The connection dropped; retrying the command may help.");
        }
        if e.is_command_start_failed() {
            return Some("Check that the program exists inside the sandbox.");
        }
    }

    if let Some(e) = error.downcast_ref::<TaskError>() {
        if e.is_command_not_started() {
            return Some("Check that the program exists inside the sandbox.");
        }
        if e.is_timeout() {
            return Some("Raise [tasks] max_poll_attempts for long-running operations.");
        }
        if e.is_terminal_failure() {
            return Some("Rerun with --verbose to see the task's logs.");
        }
    }

    None
}

/// Single-line JSON for `--json` output.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON output")
}
