//! Application configuration.
//!
//! Aggregates pool, bus and script settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bus::BusConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "alertbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ALERTBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ALERTBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ALERTBUS_LOG";

/// Environment variable telling a spawned worker which slot it owns.
pub const WORKER_SLOT_ENV_VAR: &str = "ALERTBUS_WORKER_SLOT";
/// Environment variable telling a spawned worker where the pool lives.
pub const POOL_PATH_ENV_VAR: &str = "ALERTBUS_POOL_PATH";

/// Default directory for pool pipes and the pid table.
pub const DEFAULT_POOL_PATH: &str = "/tmp/alertbus";
/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Alert bus settings.
    pub bus: BusConfig,
    /// Lua scripting settings.
    pub script: ScriptConfig,
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub workers: usize,
    /// Directory for the worker pipes and pid table.
    pub base_path: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            base_path: PathBuf::from(DEFAULT_POOL_PATH),
        }
    }
}

/// Lua scripting settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Script run once per worker at startup, typically to register handlers.
    /// Relative paths are resolved against the config file's directory.
    pub init_file: Option<PathBuf>,
    /// Wall-clock budget for one handler invocation. Unlimited when unset.
    pub handler_budget_ms: Option<u64>,
}

impl ScriptConfig {
    pub fn handler_budget(&self) -> Option<Duration> {
        self.handler_budget_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `alertbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix,
    ///    e.g. `ALERTBUS__POOL__WORKERS=8`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;

        let base_dir = match path {
            Some(p) if std::env::var(CONFIG_ENV_VAR).is_err() => Path::new(p)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            _ => config_base_dir(),
        };
        config.resolve_paths(&base_dir);
        config.validate()?;
        Ok(config)
    }

    /// Resolve relative file references against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if let Some(init_file) = &self.script.init_file {
            if init_file.is_relative() {
                self.script.init_file = Some(base_dir.join(init_file));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid(
                "pool.workers must be at least 1".to_string(),
            ));
        }
        if self.script.handler_budget_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "script.handler_budget_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Get the base directory for resolving file references in configs.
///
/// Returns the parent directory of CONFIG_ENV_VAR if set, otherwise current directory.
pub fn config_base_dir() -> PathBuf {
    if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = Path::new(&config_path);
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(".")
    }
}
