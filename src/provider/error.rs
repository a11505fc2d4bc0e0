//! Errors raised at the provider boundary.
//!
//! Typed errors let the connector tell "sandbox is gone" apart from
//! "network hiccup" without guessing from strings, except where a backend
//! only gives us text.

/// Errors that can occur while talking to a sandbox provider.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProviderError {
    /// Credentials the provider needs are not configured.
    #[error("{provider} credentials are missing: {message}")]
    MissingCredentials { provider: String, message: String },

    /// The remote sandbox is paused, missing or not ready.
    #[error("Sandbox unavailable: {message}")]
    Unavailable { message: String },

    /// Transport-level failure talking to the provider.
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// A process ran and exited non-zero. `message` is the provider's status text.
    #[error("{message}")]
    Exit {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// A process could not be started.
    #[error("Failed to start process: {message}")]
    Spawn { message: String },

    /// A file does not exist inside the sandbox.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// The provider API answered with an error status.
    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Anything else.
    #[error("{message}")]
    Other { message: String },
}

impl ProviderError {
    /// Creates a `MissingCredentials` error.
    pub(crate) fn missing_credentials(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MissingCredentials {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `Connection` error.
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an `Exit` error from a numeric exit code.
    pub(crate) fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Exit {
            message: format!("exit status {code}"),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Creates a `Spawn` error.
    pub(crate) fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Creates a `FileNotFound` error.
    pub(crate) fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an `Api` error.
    pub(crate) fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates an `Other` error.
    pub(crate) fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Returns true if credentials are missing.
    pub(crate) fn is_missing_credentials(&self) -> bool {
        matches!(self, Self::MissingCredentials { .. })
    }

    /// Returns true if the sandbox is paused, gone or not ready yet.
    ///
    /// Backends that only report free text are classified by keyword.
    pub(crate) fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Api { message, .. } | Self::Connection { message } | Self::Other { message } => {
                let message = message.to_lowercase();
                ["paused", "not found", "not ready"]
                    .iter()
                    .any(|keyword| message.contains(keyword))
            }
            _ => false,
        }
    }

    /// Returns true if the process never started.
    pub(crate) fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }

    /// Returns true if a file was missing.
    pub(crate) fn is_file_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::api(status.as_u16(), e.to_string()),
            None => Self::connection(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_variant() {
        let err = ProviderError::unavailable("Sandbox abc is paused");
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "Sandbox unavailable: Sandbox abc is paused");
    }

    #[test]
    fn test_unavailable_by_keyword() {
        assert!(ProviderError::api(404, "sandbox Not Found").is_unavailable());
        assert!(ProviderError::other("envd not ready yet").is_unavailable());
        assert!(ProviderError::connection("instance is PAUSED").is_unavailable());
        assert!(!ProviderError::connection("connection reset by peer").is_unavailable());
    }

    #[test]
    fn test_keyword_check_skips_file_errors() {
        let err = ProviderError::file_not_found("/tmp/x");
        assert!(err.is_file_not_found());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_exit_error() {
        let err = ProviderError::exit(3, "out", "err");
        assert!(matches!(err, ProviderError::Exit { .. }));
        assert!(!err.is_spawn());
        assert_eq!(err.to_string(), "exit status 3");
    }

    #[test]
    fn test_missing_credentials() {
        let err = ProviderError::missing_credentials("E2B", "set E2B_API_KEY");
        assert!(err.is_missing_credentials());
        assert!(!err.is_unavailable());
        assert_eq!(err.to_string(), "E2B credentials are missing: set E2B_API_KEY");
    }
}
