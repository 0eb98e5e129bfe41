use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::validation::{ConfigValidator, ValidationUtils};
use super::ConfigResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://workerd.sqlite".to_string(),
            max_connections: 5,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(super::ConfigError::Validation(format!(
                "database.url must be a sqlite url: {}",
                self.url
            )));
        }
        ValidationUtils::validate_count(
            self.max_connections as usize,
            "database.max_connections",
            100,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub bind_address: String,
    /// 单个任务在Worker上执行的最长时间
    pub task_timeout_seconds: u64,
    /// 握手和 get_running 查询的超时时间
    pub handshake_timeout_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7890".to_string(),
            task_timeout_seconds: 3600,
            handshake_timeout_seconds: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_socket_address(&self.bind_address, "dispatcher.bind_address")?;
        ValidationUtils::validate_timeout_seconds(
            self.task_timeout_seconds,
            "dispatcher.task_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.handshake_timeout_seconds,
            "dispatcher.handshake_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub concurrency: usize,
    pub dispatcher_address: String,
    pub reconnect_interval_seconds: u64,
    /// 使用的执行器: "shell" 或 "echo"
    pub executor: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker-001".to_string(),
            concurrency: 1,
            dispatcher_address: "127.0.0.1:7890".to_string(),
            reconnect_interval_seconds: 5,
            executor: "shell".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "worker.name")?;
        ValidationUtils::validate_count(self.concurrency, "worker.concurrency", 1000)?;
        ValidationUtils::validate_socket_address(
            &self.dispatcher_address,
            "worker.dispatcher_address",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.reconnect_interval_seconds,
            "worker.reconnect_interval_seconds",
        )?;
        ValidationUtils::validate_one_of(&self.executor, &["shell", "echo"], "worker.executor")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_one_of(
            &self.log_level,
            &["trace", "debug", "info", "warn", "error"],
            "observability.log_level",
        )?;
        ValidationUtils::validate_one_of(
            &self.log_format,
            &["json", "pretty"],
            "observability.log_format",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：默认值 → 配置文件 → `WORKERD__` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", defaults.database.url.as_str())?
            .set_default(
                "database.max_connections",
                defaults.database.max_connections as i64,
            )?
            .set_default(
                "dispatcher.bind_address",
                defaults.dispatcher.bind_address.as_str(),
            )?
            .set_default(
                "dispatcher.task_timeout_seconds",
                defaults.dispatcher.task_timeout_seconds as i64,
            )?
            .set_default(
                "dispatcher.handshake_timeout_seconds",
                defaults.dispatcher.handshake_timeout_seconds as i64,
            )?
            .set_default("worker.name", defaults.worker.name.as_str())?
            .set_default("worker.concurrency", defaults.worker.concurrency as i64)?
            .set_default(
                "worker.dispatcher_address",
                defaults.worker.dispatcher_address.as_str(),
            )?
            .set_default(
                "worker.reconnect_interval_seconds",
                defaults.worker.reconnect_interval_seconds as i64,
            )?
            .set_default("worker.executor", defaults.worker.executor.as_str())?
            .set_default(
                "observability.log_level",
                defaults.observability.log_level.as_str(),
            )?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.as_str(),
            )?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/workerd.toml", "workerd.toml", "/etc/workerd/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("WORKERD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.dispatcher.validate()?;
        self.worker.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
