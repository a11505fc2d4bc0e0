//! Sandbox providers
//!
//! This module provides a unified interface over the backends that host
//! sandboxes:
//! - E2B: cloud microVMs driven over HTTP
//! - Docker: one local container per sandbox
//! - Local: a host directory per sandbox, no isolation
//!
//! The provider is selected via `[provider].kind` in sandman.toml.

mod docker;
mod e2b;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod mock;
mod process;

pub(crate) use docker::DockerProvider;
pub(crate) use e2b::E2bProvider;
pub(crate) use error::ProviderError;
pub(crate) use local::LocalProvider;
pub(crate) use process::{collect, Completed, Process, ProcessEvent, Utf8Decoder};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Lazily produced file content.
pub(crate) type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Parameters for allocating a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreateRequest {
    /// Lifetime after which the provider may tear the sandbox down.
    pub timeout: Duration,
    /// Ports the caller wants reachable from outside.
    pub ports: Vec<u16>,
}

/// Content handed to a native filesystem write.
#[derive(Debug, Clone)]
pub(crate) enum FileContent {
    Bytes(Bytes),
    Text(String),
}

impl FileContent {
    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Self::Bytes(b) => b,
            Self::Text(t) => Bytes::from(t),
        }
    }
}

/// Trait for sandbox hosting backends.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Allocates a new sandbox.
    async fn create(&self, request: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError>;

    /// Attaches to an existing sandbox by id.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError>;
}

/// A handle on one live remote sandbox.
#[async_trait]
pub(crate) trait RemoteSandbox: Send + Sync {
    fn sandbox_id(&self) -> &str;

    /// Process execution surface. `None` means the handle is unusable.
    fn commands(&self) -> Option<Arc<dyn CommandApi>>;

    /// Native filesystem surface, probed on every call.
    ///
    /// Some backends finish attaching this asynchronously after a connect.
    async fn filesystem(&self) -> Option<Arc<dyn FilesystemApi>>;

    /// Externally reachable host (and port, where needed) for `port`.
    async fn hostname(&self, port: u16) -> Result<String, ProviderError>;

    /// Terminates the remote sandbox.
    async fn kill(&self) -> Result<(), ProviderError>;
}

/// Process execution inside a sandbox.
#[async_trait]
pub(crate) trait CommandApi: Send + Sync {
    /// Starts `argv` and returns once the provider acknowledged the start.
    async fn spawn(&self, argv: &[String]) -> Result<Process, ProviderError>;

    /// Runs `argv` to completion.
    ///
    /// A non-zero exit is reported as [`ProviderError::Exit`].
    async fn run(&self, argv: &[String]) -> Result<Completed, ProviderError> {
        let process = self.spawn(argv).await?;
        collect(process).await
    }
}

/// Native file I/O inside a sandbox.
#[async_trait]
pub(crate) trait FilesystemApi: Send + Sync {
    async fn write(&self, path: &str, content: FileContent) -> Result<(), ProviderError>;

    async fn read(&self, path: &str) -> Result<ByteStream, ProviderError>;
}

/// Supported sandbox providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum ProviderKind {
    /// E2B cloud sandboxes.
    #[default]
    E2b,
    /// Local Docker containers.
    Docker,
    /// Host directories and processes.
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::E2b => write!(f, "e2b"),
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "e2b" => Ok(Self::E2b),
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            _ => anyhow::bail!("Unknown sandbox provider: '{s}'. Supported: e2b, docker, local"),
        }
    }
}

/// Builds the provider selected in the configuration.
pub(crate) fn from_config(config: &Config) -> Result<Arc<dyn SandboxProvider>> {
    let provider: Arc<dyn SandboxProvider> = match config.provider.get_kind()? {
        ProviderKind::E2b => Arc::new(E2bProvider::new(config.e2b.clone())?),
        ProviderKind::Docker => Arc::new(DockerProvider::new(config.docker.clone())),
        ProviderKind::Local => Arc::new(LocalProvider::new(
            config.local.resolve_root(),
            config.local.native_filesystem,
        )),
    };
    Ok(provider)
}
