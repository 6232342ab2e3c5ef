//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::orchestrator::gateway::DEFAULT_CRITICAL_TOOLS;
use crate::{AppError, Result};

/// Keyring service holding the backend API key.
pub const KEYRING_SERVICE: &str = "agent-relay";

/// Environment variable consulted when the keychain has no API key.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Backend invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Explicit backend executable; located on the host when absent.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
    /// Try the SDK backend first, falling back to the subprocess backend.
    #[serde(default)]
    pub use_sdk: bool,
    /// Turn cap per execution.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Wall-clock budget per execution.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Raw messages retained per execution for summarization.
    #[serde(default = "default_max_buffered_messages")]
    pub max_buffered_messages: usize,
    /// Output read buffer size.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// Longest accepted output line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cli_path: None,
            use_sdk: false,
            max_turns: default_max_turns(),
            timeout_seconds: default_timeout_seconds(),
            max_buffered_messages: default_max_buffered_messages(),
            read_chunk_bytes: default_read_chunk_bytes(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl BackendConfig {
    /// Execution timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_max_turns() -> u32 {
    10
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_buffered_messages() -> usize {
    1000
}

fn default_read_chunk_bytes() -> usize {
    8192
}

fn default_max_line_bytes() -> usize {
    crate::stream::codec::MAX_LINE_BYTES
}

/// Capability policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ToolsConfig {
    /// Allow-list; empty means no allow-list.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Deny-list; always wins over `allowed`.
    #[serde(default)]
    pub disallowed: Vec<String>,
    /// Names whose rejection aborts the run immediately.
    #[serde(default = "default_critical_tools")]
    pub critical: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            disallowed: Vec::new(),
            critical: default_critical_tools(),
        }
    }
}

fn default_critical_tools() -> Vec<String> {
    DEFAULT_CRITICAL_TOOLS.iter().map(|s| (*s).to_owned()).collect()
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionsConfig {
    /// Idle hours before a session expires.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,
    /// Sessions per user before LRU eviction.
    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,
    /// Interval between background expiry sweeps.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_hours: default_timeout_hours(),
            max_per_user: default_max_per_user(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

fn default_timeout_hours() -> u64 {
    24
}

fn default_max_per_user() -> usize {
    5
}

fn default_sweep_interval_seconds() -> u64 {
    3600
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root every file-oriented capability call must stay under.
    pub approved_directory: PathBuf,
    /// Backend invocation settings.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Capability policy.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Session lifecycle limits.
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// `SQLite` file for session snapshots; memory-only when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Backend API key (populated at runtime, never read from TOML).
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the backend API key from OS keychain with env-var fallback.
    ///
    /// A missing key is not an error; the backend may use its own login.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task itself fails.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.api_key = load_credential("api_key", API_KEY_ENV).await?;
        Ok(())
    }

    /// Environment passed to backend processes.
    #[must_use]
    pub fn backend_env(&self) -> Vec<(String, String)> {
        self.api_key
            .iter()
            .map(|key| (API_KEY_ENV.to_owned(), key.clone()))
            .collect()
    }

    fn validate(&mut self) -> Result<()> {
        if self.backend.max_turns == 0 {
            return Err(AppError::Config("backend.max_turns must be greater than zero".into()));
        }
        if self.backend.timeout_seconds == 0 {
            return Err(AppError::Config(
                "backend.timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.backend.read_chunk_bytes == 0 || self.backend.max_line_bytes == 0 {
            return Err(AppError::Config(
                "backend read sizes must be greater than zero".into(),
            ));
        }
        if self.sessions.max_per_user == 0 {
            return Err(AppError::Config(
                "sessions.max_per_user must be greater than zero".into(),
            ));
        }
        if self.sessions.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "sessions.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        if let Some(name) = self
            .tools
            .allowed
            .iter()
            .find(|name| self.tools.disallowed.contains(name))
        {
            warn!(tool = %name, "tool is both allowed and disallowed; it will be rejected");
        }

        let canonical_root = self
            .approved_directory
            .canonicalize()
            .map_err(|err| AppError::Config(format!("approved_directory invalid: {err}")))?;
        self.approved_directory = canonical_root;

        Ok(())
    }
}

/// Load a single optional credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => debug!(key = keyring_key, "keychain entry is empty, trying env var"),
        Err(err) => debug!(key = keyring_key, ?err, "keychain lookup failed, trying env var"),
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        _ => {
            debug!(key = keyring_key, env_key, "no credential configured");
            Ok(None)
        }
    }
}
