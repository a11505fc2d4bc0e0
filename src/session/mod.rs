//! Sandbox session management.
//!
//! A [`Session`] is the process-local view of one live remote sandbox. The
//! [`SessionManager`] is the entry point: it owns the [`Connector`] (registry,
//! reconnects, TTL expiry) and the [`CommandStore`], and routes file I/O to
//! either the native filesystem API or the shell fallback depending on the
//! [`SessionHandle`] variant picked at connect time.

mod connector;
mod error;
mod executor;
mod files;
mod logs;
mod manager;
mod registry;

pub(crate) use connector::Connector;
pub(crate) use error::SessionError;
pub(crate) use executor::{CommandOutcome, CommandStatus, CommandStore, Executor};
pub(crate) use files::{FileStream, FileTransfer, FileWrite};
pub(crate) use logs::LogStream;
pub(crate) use manager::{SessionInfo, SessionManager, SessionStatus};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::provider::{CommandApi, FilesystemApi, RemoteSandbox};

/// Capabilities of a connected sandbox, decided once at connect time.
#[derive(Clone)]
pub(crate) enum SessionHandle {
    /// Commands and native file I/O.
    Native {
        commands: Arc<dyn CommandApi>,
        filesystem: Arc<dyn FilesystemApi>,
    },
    /// Commands only; file I/O goes through the shell fallback.
    CommandOnly { commands: Arc<dyn CommandApi> },
}

impl SessionHandle {
    pub(crate) fn native(commands: Arc<dyn CommandApi>, filesystem: Arc<dyn FilesystemApi>) -> Self {
        Self::Native {
            commands,
            filesystem,
        }
    }

    pub(crate) fn command_only(commands: Arc<dyn CommandApi>) -> Self {
        Self::CommandOnly { commands }
    }

    pub(crate) fn commands(&self) -> &Arc<dyn CommandApi> {
        match self {
            Self::Native { commands, .. } | Self::CommandOnly { commands } => commands,
        }
    }

    pub(crate) fn filesystem(&self) -> Option<&Arc<dyn FilesystemApi>> {
        match self {
            Self::Native { filesystem, .. } => Some(filesystem),
            Self::CommandOnly { .. } => None,
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }
}

/// One live connection to a remote sandbox.
pub(crate) struct Session {
    remote: Arc<dyn RemoteSandbox>,
    handle: SessionHandle,
    exposed_ports: Vec<u16>,
    ttl: Duration,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        remote: Arc<dyn RemoteSandbox>,
        handle: SessionHandle,
        exposed_ports: Vec<u16>,
        ttl: Duration,
    ) -> Self {
        Self {
            remote,
            handle,
            exposed_ports,
            ttl,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.remote.sandbox_id()
    }

    /// Capabilities, or `SessionClosed` once the session was replaced or closed.
    pub(crate) fn handle(&self) -> Result<&SessionHandle, SessionError> {
        if self.is_closed() {
            return Err(SessionError::session_closed(self.id()));
        }
        Ok(&self.handle)
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteSandbox> {
        &self.remote
    }

    pub(crate) fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Open and still exposing a command surface.
    pub(crate) fn is_usable(&self) -> bool {
        !self.is_closed() && self.remote.commands().is_some()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("native", &self.handle.is_native())
            .field("exposed_ports", &self.exposed_ports)
            .field("ttl", &self.ttl)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
