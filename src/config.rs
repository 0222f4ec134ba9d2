//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::data::DataServiceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("cobalt").to_string_lossy().to_string())
        .unwrap_or_else(|| "./cobalt_data".to_string())
}

fn default_database_file() -> String {
    "cobalt.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

impl StorageConfig {
    /// Full path of the SQLite database
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }
}

/// Aggregation and retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_max_backfill_days")]
    pub max_backfill_days: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_disabled_reset_hours")]
    pub disabled_reset_hours: u32,
}

fn default_max_backfill_days() -> u32 {
    7
}

fn default_retention_days() -> u32 {
    30
}

fn default_disabled_reset_hours() -> u32 {
    48 // 2 days
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_backfill_days: default_max_backfill_days(),
            retention_days: default_retention_days(),
            disabled_reset_hours: default_disabled_reset_hours(),
        }
    }
}

impl AggregationConfig {
    pub fn data_service_config(&self) -> DataServiceConfig {
        DataServiceConfig {
            max_backfill_days: self.max_backfill_days,
            disabled_reset: chrono::Duration::hours(i64::from(self.disabled_reset_hours)),
        }
    }
}

/// Metric registry configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    pub path: Option<String>,
}

impl RegistryConfig {
    /// Registry path for commands that cannot run without one
    pub fn required_path(&self) -> Result<&Path, ConfigError> {
        self.path
            .as_deref()
            .map(Path::new)
            .ok_or(ConfigError::MissingRegistry)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("cobalt").join("config.toml")),
            Some(PathBuf::from("/etc/cobalt/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("COBALT_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(path) = std::env::var("COBALT_REGISTRY_PATH") {
            self.registry.path = Some(path);
        }
        if let Ok(level) = std::env::var("COBALT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("COBALT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("No registry configured; set [registry] path or COBALT_REGISTRY_PATH")]
    MissingRegistry,
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Cobalt Store Configuration
#
# Environment variables override these settings:
# - COBALT_DATA_DIR
# - COBALT_REGISTRY_PATH
# - COBALT_LOG_LEVEL
# - COBALT_LOG_FORMAT

[storage]
# Directory holding the database (default: the platform's local data dir)
# data_dir = "/var/lib/cobalt"

# SQLite database file name inside data_dir
database_file = "cobalt.db"

[aggregation]
# Most days generated per report in one pass
max_backfill_days = 7

# Days of aggregates kept, counting the most recent completed day
retention_days = 30

# A disable longer than this starts a new enablement session (hours)
disabled_reset_hours = 48

[registry]
# Metric registry (TOML)
# path = "/etc/cobalt/registry.toml"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
