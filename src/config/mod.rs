//! Application configuration.
//!
//! One `Config` shared by every binary, loaded from YAML files and
//! environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::consumer::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use crate::bus::{RedeliveryPolicy, RetryPolicy, ORDERS_EXCHANGE};
use crate::utils::retry::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "orderbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ORDERBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ORDERBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ORDERBUS_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "ORDERBUS_LOG_FORMAT";

/// Legacy variable for the broker URL.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
/// Legacy variable for the HTTP port.
pub const PORT_ENV_VAR: &str = "PORT";
/// Legacy variable for the service name.
pub const SERVICE_NAME_ENV_VAR: &str = "SERVICE_NAME";

const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which broker implementation to connect to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// RabbitMQ over AMQP 0-9-1.
    #[default]
    Amqp,
    /// In-process broker; only meaningful when everything runs in one process.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
    pub exchange: String,
    /// Connection attempts before giving up, the first one included.
    pub connect_max_attempts: u32,
    /// Pause between connection attempts.
    pub connect_retry_delay_ms: u64,
    /// Failed attempts before a message is dead-lettered. `0` requeues forever.
    pub max_delivery_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: DEFAULT_BROKER_URL.to_string(),
            exchange: ORDERS_EXCHANGE.to_string(),
            connect_max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay_ms: DEFAULT_CONNECT_DELAY.as_millis() as u64,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl BrokerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_max_attempts,
            delay: Duration::from_millis(self.connect_retry_delay_ms),
        }
    }

    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy::from_max_attempts(self.max_delivery_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Overrides the binary's own service name in logs and responses.
    pub name: Option<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `orderbus.yaml` in current directory (if exists)
    /// 2. File specified by `CONFIG_ENV_VAR` (if set)
    /// 3. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__` separator
    /// 4. Legacy `RABBITMQ_URL`, `PORT` and `SERVICE_NAME`
    pub fn load() -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("broker.url", std::env::var(RABBITMQ_URL_ENV_VAR).ok())?
            .set_override_option("server.port", std::env::var(PORT_ENV_VAR).ok())?
            .set_override_option("service.name", std::env::var(SERVICE_NAME_ENV_VAR).ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Name for this process, falling back to the binary's default.
    pub fn service_name(&self, default: &str) -> String {
        self.service
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker.exchange",
                reason: "must not be empty".to_string(),
            });
        }
        if self.broker.kind == BrokerKind::Amqp && self.broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker.url",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Create config for testing: in-memory broker, fast retries.
    pub fn for_test() -> Self {
        Self {
            broker: BrokerConfig {
                kind: BrokerKind::Memory,
                url: "memory://".to_string(),
                connect_max_attempts: 3,
                connect_retry_delay_ms: 1,
                ..Default::default()
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            service: ServiceConfig::default(),
        }
    }
}
