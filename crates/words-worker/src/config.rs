use serde::{Deserialize, Serialize};
use words_db_postgres::PostgresConfig;
use words_repost::{
    ExecutionLimits, QueueLimits, Retention, RoutingConfig, TelegramConfig, delivery_task_name,
};
use words_storage::ServiceKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    /// Telegram Bot API settings
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Task name to queue mapping and per-queue workers
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Storage validations
        if self.storage.backend == StorageBackend::Postgres {
            let pg = &self.storage.postgres;
            if pg.url.trim().is_empty() {
                return Err("storage.postgres.url is required".into());
            }
            if pg.pool_size == 0 {
                return Err("storage.postgres.pool_size must be > 0".into());
            }
        }
        // Routing validations
        self.routing.validate()?;
        // Queue validations
        if self.queue.max_payload_bytes == 0 {
            return Err("queue.max_payload_bytes must be > 0".into());
        }
        self.queue.execution().validate()?;
        if self.queue.cleanup_interval_secs == 0 {
            return Err("queue.cleanup_interval_secs must be > 0".into());
        }
        // Telegram validation
        if self.telegram_routed() && self.telegram.bot_token.trim().is_empty() {
            return Err("telegram.bot_token is required while Telegram deliveries are routed".into());
        }
        if self.telegram.request_timeout_secs == 0 {
            return Err("telegram.request_timeout_secs must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn telegram_routed(&self) -> bool {
        self.routing
            .route(delivery_task_name(ServiceKind::Telegram))
            .is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// Process-local stores and queue. Nothing survives a restart.
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_task_time_limit_secs")]
    pub task_time_limit_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Completed and failed tasks older than this are deleted.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_payload_bytes() -> usize {
    QueueLimits::default().max_payload_bytes
}
fn default_task_time_limit_secs() -> u64 {
    ExecutionLimits::default().task_time_limit_secs
}
fn default_lease_secs() -> u64 {
    ExecutionLimits::default().lease_secs
}
fn default_retention_secs() -> u64 {
    Retention::default().retention_secs
}
fn default_cleanup_interval_secs() -> u64 {
    Retention::default().cleanup_interval_secs
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            task_time_limit_secs: default_task_time_limit_secs(),
            lease_secs: default_lease_secs(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl QueueConfig {
    pub fn limits(&self) -> QueueLimits {
        QueueLimits {
            max_payload_bytes: self.max_payload_bytes,
        }
    }

    pub fn execution(&self) -> ExecutionLimits {
        ExecutionLimits {
            task_time_limit_secs: self.task_time_limit_secs,
            lease_secs: self.lease_secs,
        }
    }

    pub fn retention(&self) -> Retention {
        Retention {
            retention_secs: self.retention_secs,
            cleanup_interval_secs: self.cleanup_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "words.toml";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("config build error: {0}")]
        Build(#[from] config::ConfigError),
        #[error("invalid configuration: {0}")]
        Invalid(String),
    }

    /// Loads the TOML file (if it exists) and applies `WORDS__*` overrides.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., WORDS__TELEGRAM__BOT_TOKEN=123:abc
        builder = builder.add_source(
            Environment::with_prefix("WORDS")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: AppConfig = builder.build()?.try_deserialize()?;
        merged.validate().map_err(ConfigError::Invalid)?;
        Ok(merged)
    }
}
