use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::poll::PollPolicy;
use crate::provider::ProviderKind;

const CONFIG_FILE: &str = "sandman.toml";

/// Environment variable holding the E2B API key.
pub const E2B_API_KEY_ENV: &str = "E2B_API_KEY";

/// Environment variable overriding `[provider].kind`.
pub const PROVIDER_ENV: &str = "SANDMAN_PROVIDER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub e2b: E2bConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub urls: UrlConfig,
}

/// Provider selection - which backend hosts the sandboxes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider to use: "e2b", "docker" or "local"
    #[serde(default = "default_provider")]
    pub kind: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider(),
        }
    }
}

impl ProviderConfig {
    /// Parse the kind string into a ProviderKind
    pub fn get_kind(&self) -> Result<ProviderKind> {
        self.kind.parse()
    }
}

fn default_provider() -> String {
    "e2b".to_string()
}

/// E2B cloud sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2bConfig {
    /// API key (falls back to the E2B_API_KEY environment variable)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Control plane base URL
    #[serde(default = "default_e2b_api_url")]
    pub api_url: String,

    /// Domain sandbox hostnames live under
    #[serde(default = "default_e2b_domain")]
    pub domain: String,

    /// Sandbox template to boot
    #[serde(default = "default_e2b_template")]
    pub template: String,

    /// Per-request timeout for control plane calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for E2bConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_e2b_api_url(),
            domain: default_e2b_domain(),
            template: default_e2b_template(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl E2bConfig {
    /// Returns the configured API key, falling back to the environment.
    ///
    /// Empty strings count as absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                std::env::var(E2B_API_KEY_ENV)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
            })
    }
}

fn default_e2b_api_url() -> String {
    "https://api.e2b.app".to_string()
}

fn default_e2b_domain() -> String {
    "e2b.app".to_string()
}

fn default_e2b_template() -> String {
    "base".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Local Docker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image every sandbox container is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Working directory for commands and relative paths
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workdir: default_workdir(),
        }
    }
}

fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_workdir() -> String {
    "/root".to_string()
}

/// Unisolated host provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding one subdirectory per sandbox
    /// - Default: <cache dir>/sandman/sandboxes
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Expose a native filesystem API (false forces the shell fallback)
    #[serde(default = "default_true")]
    pub native_filesystem: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: None,
            native_filesystem: true,
        }
    }
}

impl LocalConfig {
    /// Resolve the sandbox root directory
    pub fn resolve_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sandman")
                .join("sandboxes")
        })
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sandbox lifetime when the caller does not pass one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Smallest lifetime a caller may request
    #[serde(default = "default_timeout_ms")]
    pub min_timeout_ms: u64,

    /// Largest lifetime a caller may request
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// How many ports a sandbox may expose
    #[serde(default = "default_max_ports")]
    pub max_exposed_ports: usize,

    /// Pause before the single reconnect retry
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Interval between filesystem readiness probes
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Number of filesystem readiness probes
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            min_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_exposed_ports: default_max_ports(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            readiness_interval_ms: default_readiness_interval(),
            readiness_attempts: default_readiness_attempts(),
        }
    }
}

impl SessionConfig {
    /// Connect attempts: the first try plus exactly one retry after the backoff.
    pub fn reconnect_policy(&self) -> PollPolicy {
        PollPolicy::from_millis(self.reconnect_backoff_ms, 2)
    }

    /// Probing schedule for the filesystem surface after a connect.
    pub fn readiness_policy(&self) -> PollPolicy {
        PollPolicy::from_millis(self.readiness_interval_ms, self.readiness_attempts)
    }
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_max_timeout_ms() -> u64 {
    2_700_000
}

fn default_max_ports() -> usize {
    2
}

fn default_reconnect_backoff() -> u64 {
    2000
}

fn default_readiness_interval() -> u64 {
    1000
}

fn default_readiness_attempts() -> u32 {
    5
}

/// File transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Base64 characters per shell command in the fallback path
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Directory for fallback staging files inside the sandbox
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            temp_dir: default_temp_dir(),
        }
    }
}

fn default_chunk_size() -> usize {
    50_000
}

fn default_temp_dir() -> String {
    "/tmp".to_string()
}

/// Task submission polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl TasksConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_millis(self.poll_interval_ms, self.max_poll_attempts)
    }
}

fn default_poll_interval() -> u64 {
    500
}

fn default_max_poll_attempts() -> u32 {
    1200
}

/// Public URL settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlConfig {
    /// Domain for `https://<id>-<port>.<domain>` when the provider cannot resolve a hostname
    #[serde(default = "default_fallback_domain")]
    pub fallback_domain: String,
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            fallback_domain: default_fallback_domain(),
        }
    }
}

fn default_fallback_domain() -> String {
    "e2b.dev".to_string()
}

// Default value functions
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the project directory, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_from(&project_dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit file path, using defaults if not found
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            Self::default()
        };

        config.apply_env(std::env::var(PROVIDER_ENV).ok().as_deref());
        Ok(config)
    }

    /// Apply environment overrides
    fn apply_env(&mut self, provider_override: Option<&str>) {
        if let Some(kind) = provider_override.filter(|k| !k.trim().is_empty()) {
            self.provider.kind = kind.trim().to_string();
        }
    }
}
