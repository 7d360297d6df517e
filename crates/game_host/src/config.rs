//! Host configuration.
//!
//! Loaded from a TOML file, then overridden by `PLAYHOST_*` environment
//! variables and finally by command-line flags. A missing file is replaced by
//! a freshly written default.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plugin_runtime::{
    BuiltinCapabilities, HookTimeouts, PluginRoot, ProjectConfig, RootKind, RuntimeSettings, TokenTable,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to write default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Projects created on first start when not yet persisted.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the HTTP surface to (e.g. "127.0.0.1:8080")
    pub bind_address: String,
    /// `production` disables the CLI bypass capability.
    #[serde(default = "default_node_env")]
    pub node_env: String,
}

fn default_node_env() -> String {
    "development".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            node_env: default_node_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// Per-project store path; `{data_dir}` and `{project}` are expanded.
    pub store_pattern: String,
    /// Process-wide store holding projects, audit log and preferences.
    pub system_store: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            store_pattern: plugin_runtime::services::DEFAULT_STORE_PATTERN.to_string(),
            system_store: "{data_dir}/system.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Scanned in order; the first bundle claiming an id wins.
    pub roots: Vec<PluginRoot>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            roots: vec![PluginRoot::new(RootKind::Bundled, "plugins")],
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// Default lifecycle hook budgets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub load_ms: u64,
    pub activate_ms: u64,
    pub deactivate_ms: u64,
    pub unload_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let hooks = HookTimeouts::default();
        Self {
            load_ms: hooks.load_ms,
            activate_ms: hooks.activate_ms,
            deactivate_ms: hooks.deactivate_ms,
            unload_ms: hooks.unload_ms,
        }
    }
}

impl From<TimeoutSettings> for HookTimeouts {
    fn from(t: TimeoutSettings) -> Self {
        Self {
            load_ms: t.load_ms,
            activate_ms: t.activate_ms,
            deactivate_ms: t.deactivate_ms,
            unload_ms: t.unload_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub admin_tokens: Vec<String>,
    #[serde(default)]
    pub user_tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 120,
            refill_per_sec: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            plugins: PluginSettings::default(),
            auth: AuthSettings::default(),
            rate_limit: RateLimitSettings::default(),
            logging: LoggingSettings::default(),
            projects: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            let default_config = HostConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, toml_content).await?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies `PLAYHOST_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`. `PLAYHOST_PLUGIN_ROOTS` adds user
    /// roots after the configured ones.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("PLAYHOST_NODE_ENV").or_else(|| lookup("NODE_ENV")) {
            self.server.node_env = env;
        }
        if let Some(bind) = lookup("PLAYHOST_BIND_ADDRESS") {
            self.server.bind_address = bind;
        }
        if let Some(dir) = lookup("PLAYHOST_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(roots) = lookup("PLAYHOST_PLUGIN_ROOTS") {
            for path in std::env::split_paths(&roots).filter(|p| !p.as_os_str().is_empty()) {
                self.add_user_root(path);
            }
        }
        if let Some(level) = lookup("PLAYHOST_LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
    }

    /// Appends a user plugin root unless it is already configured.
    pub fn add_user_root(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.plugins.roots.iter().any(|r| r.path == path) {
            self.plugins.roots.push(PluginRoot::new(RootKind::User, path));
        }
    }

    pub fn is_production(&self) -> bool {
        self.server.node_env.eq_ignore_ascii_case("production")
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "Invalid bind address: {}",
                self.server.bind_address
            )));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {VALID_LOG_LEVELS:?}",
                self.logging.level
            )));
        }

        if self.plugins.roots.is_empty() {
            return Err(ConfigError::Invalid("At least one plugin root is required".to_string()));
        }
        if self.plugins.roots.iter().any(|r| r.path.as_os_str().is_empty()) {
            return Err(ConfigError::Invalid("Plugin root path cannot be empty".to_string()));
        }

        if !self.storage.store_pattern.contains("{project}") {
            return Err(ConfigError::Invalid(format!(
                "Store pattern `{}` must contain {{project}}",
                self.storage.store_pattern
            )));
        }
        if self.storage.system_store.trim().is_empty() {
            return Err(ConfigError::Invalid("System store path cannot be empty".to_string()));
        }

        if self.rate_limit.capacity == 0 || !self.rate_limit.refill_per_sec.is_finite() {
            return Err(ConfigError::Invalid("Rate limit needs a capacity and a finite refill rate".to_string()));
        }

        for project in &self.projects {
            project
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("seed project: {e}")))?;
        }

        Ok(())
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            data_dir: self.storage.data_dir.clone(),
            store_pattern: self.storage.store_pattern.clone(),
            default_timeouts: self.plugins.timeouts.into(),
        }
    }

    pub fn system_store_path(&self) -> PathBuf {
        PathBuf::from(
            self.storage
                .system_store
                .replace("{data_dir}", &self.storage.data_dir.to_string_lossy()),
        )
    }

    pub fn builtin_capabilities(&self) -> BuiltinCapabilities {
        BuiltinCapabilities {
            tokens: Arc::new(TokenTable::new(
                self.auth.admin_tokens.iter().cloned(),
                self.auth.user_tokens.iter().cloned(),
            )),
            cli_bypass: !self.is_production(),
            rate_limit_capacity: self.rate_limit.capacity,
            rate_limit_refill_per_sec: self.rate_limit.refill_per_sec,
        }
    }
}
