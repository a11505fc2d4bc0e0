//! Caller-facing facade over the session components.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::logs::stream_logs;
use super::{
    CommandOutcome, CommandStatus, CommandStore, Connector, Executor, FileStream, FileTransfer,
    FileWrite, LogStream, Session, SessionError,
};
use crate::config::{Config, SessionConfig, UrlConfig};
use crate::provider::SandboxProvider;

/// Result of `create_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionInfo {
    pub session_id: String,
    pub exposed_ports: Vec<u16>,
    pub timeout_ms: u64,
}

/// Coarse liveness of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

pub(crate) struct SessionManager {
    connector: Connector,
    executor: Executor,
    files: FileTransfer,
    session_config: SessionConfig,
    urls: UrlConfig,
}

impl SessionManager {
    /// `store` is injected so callers decide its scope.
    pub(crate) fn new(provider: Arc<dyn SandboxProvider>, config: &Config, store: Arc<CommandStore>) -> Self {
        Self {
            connector: Connector::new(provider, config.session.clone()),
            executor: Executor::new(store),
            files: FileTransfer::new(&config.files),
            session_config: config.session.clone(),
            urls: config.urls.clone(),
        }
    }

    pub(crate) fn provider_name(&self) -> &'static str {
        self.connector.provider_name()
    }

    pub(crate) async fn create_session(
        &self,
        timeout_ms: Option<u64>,
        exposed_ports: Vec<u16>,
    ) -> Result<SessionInfo, SessionError> {
        let cfg = &self.session_config;
        let timeout_ms = timeout_ms.unwrap_or(cfg.default_timeout_ms);

        if !(cfg.min_timeout_ms..=cfg.max_timeout_ms).contains(&timeout_ms) {
            return Err(SessionError::invalid_request(format!(
                "timeoutMs must be between {} and {}, got {timeout_ms}",
                cfg.min_timeout_ms, cfg.max_timeout_ms
            )));
        }
        if exposed_ports.len() > cfg.max_exposed_ports {
            return Err(SessionError::invalid_request(format!(
                "at most {} exposed ports are allowed, got {}",
                cfg.max_exposed_ports,
                exposed_ports.len()
            )));
        }
        if exposed_ports.contains(&0) {
            return Err(SessionError::invalid_request("port 0 cannot be exposed"));
        }

        let session = self
            .connector
            .create(Duration::from_millis(timeout_ms), exposed_ports)
            .await?;

        Ok(SessionInfo {
            session_id: session.id().to_string(),
            exposed_ports: session.exposed_ports().to_vec(),
            timeout_ms,
        })
    }

    pub(crate) async fn ensure_connected(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.connector.ensure_connected(session_id).await
    }

    pub(crate) async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        args: &[String],
        sudo: bool,
        wait: bool,
    ) -> Result<CommandOutcome, SessionError> {
        let session = self.ensure_connected(session_id).await?;
        self.executor.run(&session, command, args, sudo, wait).await
    }

    pub(crate) async fn write_files(&self, session_id: &str, files: &[FileWrite]) -> Result<(), SessionError> {
        let session = self.ensure_connected(session_id).await?;
        self.files.write(&session, files).await?;
        info!("Wrote {} file(s) to sandbox {}", files.len(), session_id);
        Ok(())
    }

    pub(crate) async fn read_file(&self, session_id: &str, path: &str) -> Result<FileStream, SessionError> {
        let session = self.ensure_connected(session_id).await?;
        self.files.read(&session, path).await
    }

    pub(crate) async fn stream_command_logs(&self, command_id: &str) -> Result<LogStream, SessionError> {
        stream_logs(self.executor.store(), command_id).await
    }

    pub(crate) async fn command_status(&self, command_id: &str) -> Result<CommandStatus, SessionError> {
        self.executor.status(command_id).await
    }

    /// Public URL for `port`; falls back to `https://<id>-<port>.<domain>`
    /// when the provider cannot name a host.
    pub(crate) async fn resolve_url(&self, session_id: &str, port: u16) -> Result<String, SessionError> {
        if port == 0 {
            return Err(SessionError::invalid_request("port must be between 1 and 65535"));
        }

        let session = self.ensure_connected(session_id).await?;
        match session.remote().hostname(port).await {
            Ok(host) => Ok(url_for_host(&host)),
            Err(e) => {
                debug!("Hostname lookup for {}:{} failed: {}", session_id, port, e);
                Ok(self.fallback_url(session_id, port))
            }
        }
    }

    fn fallback_url(&self, session_id: &str, port: u16) -> String {
        format!("https://{session_id}-{port}.{}", self.urls.fallback_domain)
    }

    /// Any failure, whatever its cause, reads as stopped.
    pub(crate) async fn status(&self, session_id: &str, deep: bool) -> SessionStatus {
        let session = match self.ensure_connected(session_id).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Sandbox {} reported stopped: {}", session_id, e);
                return SessionStatus::Stopped;
            }
        };

        if !deep {
            return SessionStatus::Running;
        }

        let echo = ["sandman-ok".to_string()];
        match self.executor.run(&session, "echo", &echo, false, true).await {
            Ok(outcome) if outcome.exit_code == Some(0) => SessionStatus::Running,
            Ok(outcome) => {
                debug!("Deep probe of {} exited with {:?}", session_id, outcome.exit_code);
                SessionStatus::Stopped
            }
            Err(e) => {
                debug!("Deep probe of {} failed: {}", session_id, e);
                SessionStatus::Stopped
            }
        }
    }

    /// Forgets the session. Returns false if none was registered.
    pub(crate) async fn close_session(&self, session_id: &str) -> bool {
        self.connector.close(session_id).await
    }

    /// Terminates the remote sandbox and closes the session.
    pub(crate) async fn kill_session(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.ensure_connected(session_id).await?;
        session.remote().kill().await.map_err(|e| {
            if e.is_unavailable() {
                SessionError::sandbox_unavailable(session_id)
            } else {
                SessionError::connection_failed(session_id, e.to_string())
            }
        })?;

        self.close_session(session_id).await;
        session.close();
        info!("Killed sandbox {}", session_id);
        Ok(())
    }
}

/// Loopback hosts are served over plain HTTP.
fn url_for_host(host: &str) -> String {
    if host.starts_with("localhost") || host.starts_with("127.") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockProvider, MockReply};
    use crate::provider::ProviderError;
    use crate::session::logs::StreamKind;
    use futures_util::StreamExt;

    fn manager(mock: &MockProvider) -> SessionManager {
        SessionManager::new(
            Arc::new(mock.clone()),
            &Config::default(),
            Arc::new(CommandStore::default()),
        )
    }

    #[tokio::test]
    async fn test_create_session_defaults() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        let info = manager.create_session(None, vec![3000]).await.unwrap();

        assert_eq!(info.session_id, "mock-1");
        assert_eq!(info.exposed_ports, vec![3000]);
        assert_eq!(info.timeout_ms, 600_000);
        assert_eq!(mock.creates(), 1);
    }

    #[tokio::test]
    async fn test_create_session_validation() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        for (timeout, ports) in [
            (Some(599_999), vec![]),
            (Some(2_700_001), vec![]),
            (None, vec![3000, 3001, 3002]),
            (None, vec![0]),
        ] {
            let err = manager.create_session(timeout, ports).await.unwrap_err();
            assert!(matches!(err, SessionError::InvalidRequest { .. }));
        }
        assert_eq!(mock.creates(), 0);

        assert!(manager.create_session(Some(2_700_000), vec![80, 443]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_then_reports_stopped() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        let info = manager.create_session(Some(600_000), vec![]).await.unwrap();
        assert_eq!(manager.status(&info.session_id, false).await, SessionStatus::Running);

        tokio::time::sleep(Duration::from_millis(600_001)).await;

        assert!(manager.connector.registered(&info.session_id).await.is_none());
        assert_eq!(manager.status(&info.session_id, false).await, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let mock = MockProvider::new();
        mock.reply("exit 3", MockReply::exit(3, "", ""));
        let manager = manager(&mock);

        let outcome = manager
            .run_command("sbx1", "sh", &["-c".to_string(), "exit 3".to_string()], false, true)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_logs_of_completed_command() {
        let mock = MockProvider::new();
        mock.reply("cat", MockReply::exit(0, "a\nb\n", ""));
        let manager = manager(&mock);

        let outcome = manager
            .run_command("sbx1", "cat", &["f".to_string()], false, true)
            .await
            .unwrap();
        let lines: Vec<_> = manager
            .stream_command_logs(&outcome.command_id)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].data, "a");
        assert_eq!(lines[1].data, "b");
        assert!(lines.iter().all(|l| l.stream == StreamKind::Stdout));

        let status = manager.command_status(&outcome.command_id).await.unwrap();
        assert_eq!(status.sandbox_id, "sbx1");
        assert_eq!(status.command, "cat f");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        manager
            .write_files("sbx1", &[FileWrite::new("app/index.js", "console.log(1)")])
            .await
            .unwrap();

        let chunks: Vec<_> = manager
            .read_file("sbx1", "app/index.js")
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(chunks.concat(), b"console.log(1)");
    }

    #[tokio::test]
    async fn test_resolve_url_from_hostname() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        let url = manager.resolve_url("sbx1", 3000).await.unwrap();
        assert_eq!(url, "https://3000-sbx1.mock.dev");
    }

    #[tokio::test]
    async fn test_resolve_url_fallback_is_deterministic() {
        let mock = MockProvider::new();
        mock.fail_hostname();
        let manager = manager(&mock);

        let first = manager.resolve_url("sbx1", 3000).await.unwrap();
        let second = manager.resolve_url("sbx1", 3000).await.unwrap();
        assert_eq!(first, "https://sbx1-3000.e2b.dev");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolve_url_connection_error_propagates() {
        let mock = MockProvider::new();
        mock.fail_connects(vec![ProviderError::connection("reset")]);
        let manager = manager(&mock);

        let err = manager.resolve_url("sbx1", 3000).await.unwrap_err();
        assert!(err.is_connection_failed());

        let err = manager.resolve_url("sbx1", 0).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_deep_status() {
        let mock = MockProvider::new();
        let manager = manager(&mock);
        assert_eq!(manager.status("sbx1", true).await, SessionStatus::Running);

        mock.reply("echo", MockReply::Fail("agent unreachable".to_string()));
        assert_eq!(manager.status("sbx1", true).await, SessionStatus::Stopped);
        // The shallow probe only needs a connection
        assert_eq!(manager.status("sbx1", false).await, SessionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_session() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        let info = manager.create_session(None, vec![]).await.unwrap();
        let session = manager.ensure_connected(&info.session_id).await.unwrap();

        manager.kill_session(&info.session_id).await.unwrap();

        assert_eq!(mock.kills(), 1);
        assert!(session.is_closed());
        assert_eq!(manager.status(&info.session_id, false).await, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_close_session() {
        let mock = MockProvider::new();
        let manager = manager(&mock);

        let session = manager.ensure_connected("sbx1").await.unwrap();
        assert!(manager.close_session("sbx1").await);
        assert!(session.is_closed());
        assert!(!manager.close_session("sbx1").await);
    }

    #[test]
    fn test_url_for_host() {
        assert_eq!(url_for_host("localhost:3000"), "http://localhost:3000");
        assert_eq!(url_for_host("3000-abc.e2b.app"), "https://3000-abc.e2b.app");
    }
}
