// Author Configuration
// Layered settings: defaults, TOML file, .env, then environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::protocol::AuthorMode;
use crate::services::error::{AuthorError, AuthorResult};

/// Application identifier used for the data directory
pub const APP_IDENTIFIER: &str = "com.author.Author";

/// Environment variable naming an optional TOML config file
pub const CONFIG_ENV: &str = "AUTHOR_CONFIG";

// ============================================================================
// Sections
// ============================================================================

/// How the agent runtime is launched and probed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Program and arguments used to launch the runtime
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// When false the host assumes the runtime is already listening
    pub spawn: bool,
    pub health_path: String,
    pub startup_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            command: vec!["python3".to_string(), "main.py".to_string()],
            working_dir: None,
            spawn: true,
            health_path: "/health".to_string(),
            startup_timeout_ms: 30_000,
            health_poll_interval_ms: 500,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Agent socket and reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    pub agent_path: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            agent_path: "/ws/agent".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 2_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Database file; `None` means the platform data directory
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the database location
    pub fn resolve_database_path(&self) -> AuthorResult<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let base = dirs::data_dir().ok_or_else(|| {
            AuthorError::Config("Cannot determine platform data directory".to_string())
        })?;
        Ok(base
            .join(APP_IDENTIFIER)
            .join(crate::utils::database::DATABASE_FILE))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub default_mode: AuthorMode,
}

// ============================================================================
// AuthorConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthorConfig {
    pub backend: BackendConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
}

impl AuthorConfig {
    /// Load configuration from every layer
    ///
    /// `explicit` wins over `AUTHOR_CONFIG`. A missing explicit file is an error,
    /// a missing `.env` is not.
    pub fn load(explicit: Option<&Path>) -> AuthorResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("[Config] Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("[Config] Ignoring unreadable .env: {}", e),
        }

        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&expand_path(&path)?)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> AuthorResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AuthorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
            .map_err(|e| AuthorError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("Invalid config: {}", e))
    }

    /// Apply environment overrides using `lookup` for each variable
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AuthorResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BACKEND_HOST") {
            self.backend.host = host;
        }
        if let Some(port) = lookup("BACKEND_PORT") {
            self.backend.port = port
                .trim()
                .parse()
                .map_err(|_| AuthorError::Config(format!("Invalid BACKEND_PORT: {}", port)))?;
        }
        if let Some(command) = lookup("AUTHOR_BACKEND_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(AuthorError::Config(
                    "AUTHOR_BACKEND_COMMAND is empty".to_string(),
                ));
            }
            self.backend.command = parts;
        }
        if let Some(dir) = lookup("AUTHOR_BACKEND_DIR") {
            self.backend.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("AUTHOR_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = lookup("AUTHOR_MODE") {
            self.agent.default_mode = mode.parse().map_err(AuthorError::Config)?;
        }
        if let Some(spawn) = lookup("AUTHOR_SPAWN_BACKEND") {
            self.backend.spawn = parse_bool(&spawn).ok_or_else(|| {
                AuthorError::Config(format!("Invalid AUTHOR_SPAWN_BACKEND: {}", spawn))
            })?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) -> AuthorResult<()> {
        if let Some(dir) = &self.backend.working_dir {
            self.backend.working_dir = Some(expand_path(dir)?);
        }
        if let Some(path) = &self.storage.database_path {
            self.storage.database_path = Some(expand_path(path)?);
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Expand `~` and `$VAR` in a path
pub fn expand_path(path: &Path) -> AuthorResult<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| AuthorError::Config(format!("Failed to expand {}: {}", raw, e)))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
