//! Establishes, caches and expires sessions.
//!
//! Connect attempts for one sandbox id are serialised through a per-id gate,
//! so concurrent callers for an unregistered id share a single remote
//! connect. Different ids never wait on each other beyond the short registry
//! lock.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::registry::Registry;
use super::{Session, SessionError, SessionHandle};
use crate::config::SessionConfig;
use crate::poll::{poll_until, PollError};
use crate::provider::{CreateRequest, ProviderError, RemoteSandbox, SandboxProvider};

pub(crate) struct Connector {
    provider: Arc<dyn SandboxProvider>,
    registry: Arc<Mutex<Registry>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: SessionConfig,
}

impl Connector {
    pub(crate) fn new(provider: Arc<dyn SandboxProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            registry: Arc::new(Mutex::new(Registry::default())),
            gates: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub(crate) fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Allocates a new sandbox, registers it and schedules its expiry.
    pub(crate) async fn create(&self, ttl: Duration, ports: Vec<u16>) -> Result<Arc<Session>, SessionError> {
        let request = CreateRequest {
            timeout: ttl,
            ports: ports.clone(),
        };

        info!("Creating {} sandbox (ttl {:?}, ports {:?})", self.provider.name(), ttl, ports);
        let remote = self.provider.create(&request).await.map_err(|e| {
            if e.is_missing_credentials() {
                SessionError::provider_unavailable(e.to_string())
            } else {
                SessionError::connection_failed("(new)", e.to_string())
            }
        })?;

        let session = Arc::new(self.attach(remote, ports, ttl).await?);
        self.register(session.clone()).await;
        self.schedule_expiry(&session);

        info!("Sandbox {} ready", session.id());
        Ok(session)
    }

    /// Returns a usable session for `id`, connecting if needed.
    pub(crate) async fn ensure_connected(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.cached(id).await {
            return Ok(session);
        }

        let gate = self.gates.lock().await.entry(id.to_string()).or_default().clone();

        let result = {
            let _permit = gate.lock().await;
            // Another caller may have connected while we waited for the gate.
            match self.cached(id).await {
                Some(session) => Ok(session),
                None => self.connect_and_register(id).await,
            }
        };

        self.release_gate(id, gate).await;
        result
    }

    /// Removes the session and marks it closed. Returns false if none was registered.
    pub(crate) async fn close(&self, id: &str) -> bool {
        let removed = self.registry.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.close();
                info!("Closed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Registered session for `id`, without connecting.
    #[cfg(test)]
    pub(crate) async fn registered(&self, id: &str) -> Option<Arc<Session>> {
        self.registry.lock().await.get(id)
    }

    /// Registered usable session, evicting an unusable one.
    async fn cached(&self, id: &str) -> Option<Arc<Session>> {
        let mut registry = self.registry.lock().await;
        let session = registry.get(id)?;
        if session.is_usable() {
            return Some(session);
        }

        warn!("Cached session {} is no longer usable, reconnecting", id);
        registry.remove_if_same(id, &session);
        session.close();
        None
    }

    async fn connect_and_register(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let remote = self.connect(id).await?;
        let ttl = Duration::from_millis(self.config.default_timeout_ms);
        let session = Arc::new(self.attach(remote, Vec::new(), ttl).await?);
        self.register(session.clone()).await;
        Ok(session)
    }

    /// Provider connect with one retry for paused or missing sandboxes.
    async fn connect(&self, id: &str) -> Result<Arc<dyn RemoteSandbox>, SessionError> {
        let policy = self.config.reconnect_policy();

        let result = poll_until(policy, |attempt| async move {
            debug!("Connecting to sandbox {} (attempt {})", id, attempt);
            match self.provider.connect(id).await {
                Ok(remote) => Ok(Some(remote)),
                Err(e) if e.is_unavailable() => {
                    warn!("Sandbox {} unavailable on attempt {}: {}", id, attempt, e);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await;

        match result {
            Ok(remote) => Ok(remote),
            Err(PollError::Timeout { .. }) => Err(SessionError::sandbox_unavailable(id)),
            Err(PollError::Failed(e)) => Err(classify_connect_error(id, &e)),
        }
    }

    /// Builds a session, waiting briefly for the filesystem surface.
    async fn attach(
        &self,
        remote: Arc<dyn RemoteSandbox>,
        ports: Vec<u16>,
        ttl: Duration,
    ) -> Result<Session, SessionError> {
        let id = remote.sandbox_id().to_string();
        let commands = remote.commands().ok_or_else(|| {
            SessionError::connection_failed(&id, "sandbox handle exposes no command execution")
        })?;

        let policy = self.config.readiness_policy();
        let probe = &remote;
        let filesystem = poll_until(policy, |_| async move {
            Ok::<_, Infallible>(probe.filesystem().await)
        })
        .await;

        let handle = match filesystem {
            Ok(filesystem) => {
                debug!("Filesystem API ready for sandbox {}", id);
                SessionHandle::native(commands, filesystem)
            }
            Err(_) => {
                warn!(
                    "Filesystem API for sandbox {} not ready after {:?}, using shell fallback",
                    id,
                    policy.budget()
                );
                SessionHandle::command_only(commands)
            }
        };

        Ok(Session::new(remote, handle, ports, ttl))
    }

    /// Inserts `session`, closing whatever it replaces.
    async fn register(&self, session: Arc<Session>) {
        let replaced = self.registry.lock().await.put(session.id(), session.clone());
        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, &session) {
                debug!("Replacing session {}", session.id());
                old.close();
            }
        }
    }

    /// One-shot removal at TTL. In-flight operations are left alone.
    fn schedule_expiry(&self, session: &Arc<Session>) {
        let registry = self.registry.clone();
        let weak = Arc::downgrade(session);
        let id = session.id().to_string();
        let ttl = session.ttl();

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            if registry.lock().await.remove_if_same(&id, &session) {
                info!("Session {} expired after {:?}", id, ttl);
            }
        });
    }

    async fn release_gate(&self, id: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        drop(gate);
        if gates.get(id).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(id);
        }
    }

    #[cfg(test)]
    async fn registry_len(&self) -> usize {
        self.registry.lock().await.len()
    }
}

fn classify_connect_error(id: &str, error: &ProviderError) -> SessionError {
    if error.is_missing_credentials() {
        SessionError::provider_unavailable(error.to_string())
    } else {
        SessionError::connection_failed(id, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use tokio::time::Instant;

    fn connector(mock: &MockProvider) -> Connector {
        Connector::new(Arc::new(mock.clone()), SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_remote_connect() {
        let mock = MockProvider::new();
        mock.set_connect_delay(Duration::from_millis(100));
        let connector = connector(&mock);

        let (a, b) = tokio::join!(
            connector.ensure_connected("sbx1"),
            connector.ensure_connected("sbx1")
        );

        assert_eq!(mock.connects(), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_ids_connect_independently() {
        let mock = MockProvider::new();
        mock.set_connect_delay(Duration::from_millis(100));
        let connector = connector(&mock);
        let start = Instant::now();

        let (a, b) = tokio::join!(
            connector.ensure_connected("sbx1"),
            connector.ensure_connected("sbx2")
        );

        assert_eq!(a.unwrap().id(), "sbx1");
        assert_eq!(b.unwrap().id(), "sbx2");
        assert_eq!(mock.connects(), 2);
        // Both connects overlapped
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_session_is_reused() {
        let mock = MockProvider::new();
        let connector = connector(&mock);

        let first = connector.ensure_connected("sbx1").await.unwrap();
        let second = connector.ensure_connected("sbx1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_once_after_backoff() {
        let mock = MockProvider::new();
        mock.fail_connects(vec![ProviderError::unavailable("Sandbox sbx1 is paused")]);
        let connector = connector(&mock);
        let start = Instant::now();

        let session = connector.ensure_connected("sbx1").await.unwrap();

        assert_eq!(session.id(), "sbx1");
        assert_eq!(mock.connects(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_twice_is_sandbox_unavailable() {
        let mock = MockProvider::new();
        mock.fail_connects(vec![
            ProviderError::unavailable("paused"),
            ProviderError::api(404, "sandbox not found"),
        ]);
        let connector = connector(&mock);

        let err = connector.ensure_connected("sbx1").await.unwrap_err();

        assert!(err.is_sandbox_unavailable());
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_not_retried() {
        let mock = MockProvider::new();
        mock.fail_connects(vec![ProviderError::missing_credentials("E2B", "no key")]);
        let connector = connector(&mock);

        let err = connector.ensure_connected("sbx1").await.unwrap_err();

        assert!(err.is_provider_unavailable());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_connection_failures() {
        let mock = MockProvider::new();
        mock.fail_connects(vec![ProviderError::connection("connection reset by peer")]);
        let connector = connector(&mock);

        let err = connector.ensure_connected("sbx1").await.unwrap_err();

        assert!(err.is_connection_failed());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_filesystem_readiness() {
        let mock = MockProvider::new();
        mock.filesystem_ready_after(2);
        let connector = connector(&mock);
        let start = Instant::now();

        let session = connector.ensure_connected("sbx1").await.unwrap();

        assert!(session.handle().unwrap().is_native());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proceeds_without_filesystem() {
        let mock = MockProvider::new();
        mock.without_filesystem();
        let connector = connector(&mock);
        let start = Instant::now();

        let session = connector.ensure_connected("sbx1").await.unwrap();

        assert!(!session.handle().unwrap().is_native());
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_unusable_cached_session() {
        let mock = MockProvider::new();
        let connector = connector(&mock);

        let first = connector.ensure_connected("sbx1").await.unwrap();
        mock.drop_command_surfaces();

        let second = connector.ensure_connected("sbx1").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert!(second.is_usable());
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commandless_connect_fails() {
        let mock = MockProvider::new();
        mock.commandless_connects(1);
        let connector = connector(&mock);

        let err = connector.ensure_connected("sbx1").await.unwrap_err();
        assert!(err.is_connection_failed());
        assert_eq!(connector.registry_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_removes_entry_without_closing() {
        let mock = MockProvider::new();
        let connector = connector(&mock);

        let session = connector
            .create(Duration::from_millis(600_000), vec![3000])
            .await
            .unwrap();
        assert_eq!(session.exposed_ports(), &[3000]);
        assert!(connector.registered(session.id()).await.is_some());

        tokio::time::sleep(Duration::from_millis(600_001)).await;

        assert!(connector.registered(session.id()).await.is_none());
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_missing_credentials() {
        struct NoKey;

        #[async_trait::async_trait]
        impl SandboxProvider for NoKey {
            fn name(&self) -> &'static str {
                "nokey"
            }
            async fn create(&self, _: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
                Err(ProviderError::missing_credentials("nokey", "no key"))
            }
            async fn connect(&self, _: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
                Err(ProviderError::missing_credentials("nokey", "no key"))
            }
        }

        let connector = Connector::new(Arc::new(NoKey), SessionConfig::default());
        let err = connector
            .create(Duration::from_secs(600), vec![])
            .await
            .unwrap_err();
        assert!(err.is_provider_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_marks_session_closed() {
        let mock = MockProvider::new();
        let connector = connector(&mock);

        let session = connector.ensure_connected("sbx1").await.unwrap();
        assert!(connector.close("sbx1").await);
        assert!(session.is_closed());
        assert!(!connector.close("sbx1").await);

        // A later call reconnects with a fresh handle
        let again = connector.ensure_connected("sbx1").await.unwrap();
        assert!(!Arc::ptr_eq(&session, &again));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates_are_cleaned_up() {
        let mock = MockProvider::new();
        let connector = connector(&mock);

        connector.ensure_connected("sbx1").await.unwrap();
        assert!(connector.gates.lock().await.is_empty());
    }
}
