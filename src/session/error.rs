//! Error taxonomy for session operations.
//!
//! Callers match on variants to decide between "create a new sandbox",
//! "retry later" and "fix the request".

/// Errors surfaced by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum SessionError {
    /// Provider credentials are missing. Not retried.
    #[error("Sandbox provider is unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// The remote sandbox is paused or gone.
    #[error("Sandbox {sandbox_id} is paused or has been terminated. Please create a new sandbox.")]
    SandboxUnavailable { sandbox_id: String },

    /// Transient failure; the caller may retry the whole operation.
    #[error("Failed to connect to sandbox {sandbox_id}: {message}")]
    ConnectionFailed { sandbox_id: String, message: String },

    /// The handle was replaced or closed while the operation was using it.
    #[error("Session for sandbox {sandbox_id} was closed")]
    SessionClosed { sandbox_id: String },

    /// The request itself is malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Failed to start command `{command}`: {message}")]
    CommandStartFailed { command: String, message: String },

    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command {command_id} not found")]
    CommandNotFound { command_id: String },

    #[error("Failed to write file {path}: {message}")]
    FileWriteFailed { path: String, message: String },

    #[error("Failed to read file {path}: {message}")]
    FileReadFailed { path: String, message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },
}

impl SessionError {
    /// Creates a `ProviderUnavailable` error.
    pub(crate) fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `SandboxUnavailable` error.
    pub(crate) fn sandbox_unavailable(sandbox_id: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Creates a `ConnectionFailed` error.
    pub(crate) fn connection_failed(sandbox_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            sandbox_id: sandbox_id.into(),
            message: message.into(),
        }
    }

    /// Creates a `SessionClosed` error.
    pub(crate) fn session_closed(sandbox_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Creates an `InvalidRequest` error.
    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a `CommandStartFailed` error.
    pub(crate) fn command_start_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandStartFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates a `CommandFailed` error.
    pub(crate) fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates a `CommandNotFound` error.
    pub(crate) fn command_not_found(command_id: impl Into<String>) -> Self {
        Self::CommandNotFound {
            command_id: command_id.into(),
        }
    }

    /// Creates a `FileWriteFailed` error.
    pub(crate) fn file_write_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a `FileReadFailed` error.
    pub(crate) fn file_read_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a `FileNotFound` error.
    pub(crate) fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Returns true if the caller should create a new sandbox.
    pub(crate) fn is_sandbox_unavailable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable { .. })
    }

    /// Returns true if credentials are missing.
    pub(crate) fn is_provider_unavailable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }

    /// Returns true if this is a transient connection failure.
    pub(crate) fn is_connection_failed(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }

    /// Returns true if the command never started.
    pub(crate) fn is_command_start_failed(&self) -> bool {
        matches!(self, Self::CommandStartFailed { .. })
    }

    /// Returns true if the session handle was closed underneath the operation.
    pub(crate) fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }
}
