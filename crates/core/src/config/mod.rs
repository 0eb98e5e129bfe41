//! 配置管理
//!
//! 配置来源按优先级从低到高：内置默认值、TOML配置文件、`WORKERD__` 前缀的环境变量，
//! 例如 `WORKERD__DISPATCHER__BIND_ADDRESS=0.0.0.0:7890`。
//!
//! ```toml
//! [database]
//! url = "sqlite://workerd.sqlite"
//! max_connections = 5
//!
//! [dispatcher]
//! bind_address = "127.0.0.1:7890"
//! task_timeout_seconds = 3600
//! handshake_timeout_seconds = 5
//!
//! [worker]
//! name = "worker-001"
//! concurrency = 2
//! dispatcher_address = "127.0.0.1:7890"
//! reconnect_interval_seconds = 5
//! executor = "shell"
//!
//! [observability]
//! log_level = "info"
//! log_format = "pretty"
//! ```

pub mod app_config;
pub mod validation;

pub use app_config::*;
pub use validation::{ConfigValidator, ValidationUtils};

/// Configuration error type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error enumeration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<anyhow::Error> for ConfigError {
    fn from(err: anyhow::Error) -> Self {
        ConfigError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<ConfigError> for crate::SchedulerError {
    fn from(err: ConfigError) -> Self {
        crate::SchedulerError::Configuration(err.to_string())
    }
}
